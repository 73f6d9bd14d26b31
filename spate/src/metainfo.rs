//! Decoding of `.torrent` (metainfo) files.
//!
//! Only the fields the engine consumes are kept: the announce url, the piece
//! geometry, the SHA-1 piece hashes and the file list. Everything else in the
//! metainfo is ignored.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::*, PieceIndex, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Decodes and validates the raw contents of a `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;

        let info = &metainfo.info;
        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces string is not a multiple of 20 bytes",
            ));
        }
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length is zero"));
        }
        // a torrent is either a single file or an archive, never both
        match (&info.length, &info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "both length and files present",
                ));
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "neither length nor files present",
                ));
            }
            (None, Some(files)) if files.is_empty() => {
                return Err(Error::InvalidMetainfo("empty files list"));
            }
            _ => {}
        }

        let download_len = metainfo.download_len();
        if download_len == 0 {
            return Err(Error::InvalidMetainfo("torrent is empty"));
        }
        // the piece hashes must cover the download exactly
        let piece_count = (download_len + info.piece_length - 1)
            / info.piece_length;
        if piece_count != (info.pieces.len() / 20) as u64 {
            return Err(Error::InvalidMetainfo(
                "piece hash count doesn't match the download length",
            ));
        }

        Ok(metainfo)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected SHA-1 hash of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// The sum of the lengths of all files in the torrent.
    pub fn download_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (_, Some(files)) => files.iter().map(|f| f.length).sum(),
            _ => 0,
        }
    }

    /// Whether the torrent is a multi file archive.
    pub fn is_archive(&self) -> bool {
        self.info.files.is_some()
    }

    /// The SHA-1 hash of the bencoded info dictionary, identifying the
    /// torrent towards the tracker and other peers.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

// The fields are declared in the lexicographical order of their bencode keys:
// re-serializing the struct has to reproduce the exact dictionary the torrent
// creator hashed, and bencode dictionaries are key sorted.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // A hand built single file torrent: 32 bytes in 2 pieces of 16 bytes.
    fn single_file_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce24:http://tracker.test:6969");
        buf.extend_from_slice(b"4:infod");
        buf.extend_from_slice(b"6:lengthi32e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi16e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[0xaa; 20]);
        buf.extend_from_slice(&[0xbb; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_decode_single_file() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.test:6969");
        assert_eq!(metainfo.info.name, "test.bin");
        assert_eq!(metainfo.info.piece_length, 16);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.download_len(), 32);
        assert!(!metainfo.is_archive());
        assert_eq!(metainfo.piece_hash(0), [0xaa; 20]);
        assert_eq!(metainfo.piece_hash(1), [0xbb; 20]);
    }

    #[test]
    fn test_decode_archive() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce24:http://tracker.test:6969");
        buf.extend_from_slice(b"4:infod");
        buf.extend_from_slice(b"5:filesl");
        buf.extend_from_slice(b"d6:lengthi20e4:pathl1:a1:bee");
        buf.extend_from_slice(b"d6:lengthi12e4:pathl1:cee");
        buf.extend_from_slice(b"e");
        buf.extend_from_slice(b"4:name4:arch");
        buf.extend_from_slice(b"12:piece lengthi16e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[1; 20]);
        buf.extend_from_slice(&[2; 20]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_archive());
        assert_eq!(metainfo.download_len(), 32);
        let files = metainfo.info.files.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(files[1].length, 12);
    }

    #[test]
    fn test_reject_truncated_pieces() {
        // 30 byte pieces string is not a multiple of 20
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce24:http://tracker.test:6969");
        buf.extend_from_slice(b"4:infod");
        buf.extend_from_slice(b"6:lengthi32e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi16e");
        buf.extend_from_slice(b"6:pieces30:");
        buf.extend_from_slice(&[0xaa; 30]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_reject_wrong_piece_count() {
        // 3 hashes for a 2 piece download
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce24:http://tracker.test:6969");
        buf.extend_from_slice(b"4:infod");
        buf.extend_from_slice(b"6:lengthi32e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi16e");
        buf.extend_from_slice(b"6:pieces60:");
        buf.extend_from_slice(&[0xaa; 60]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_info_hash_is_hash_of_reencoded_info() {
        let raw = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&raw).unwrap();

        // the info dictionary as it appears inside the torrent file
        let start = raw
            .windows(7)
            .position(|w| w == b"4:infod")
            .unwrap()
            + "4:info".len();
        // strip the final dictionary terminator of the outer dict
        let info_slice = &raw[start..raw.len() - 1];

        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(info_slice));
        assert_eq!(metainfo.create_info_hash().unwrap(), expected);
    }
}
