// src/protocol/pack.rs
//! Reading a packfile off a live stream.
//!
//! A push does not frame or length-prefix its packfile and the client keeps
//! the connection open while it waits for the status report, so the only way
//! to know where the pack ends is to walk its entries.

use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::AsyncRead;

use super::pktline::PktReader;
use super::receive::PACK_SIGNATURE;
use crate::error::{Error, Result};

const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 20;

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Parsed fixed-size pack header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u32,
    pub objects: u32,
}

impl PackHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[..4] != PACK_SIGNATURE {
            return Err(Error::Transport("packfile signature mismatch".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 && version != 3 {
            return Err(Error::Transport(format!("unsupported pack version {version}")));
        }
        let objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        Ok(Self { version, objects })
    }
}

struct Scanner<'a, R> {
    reader: &'a mut PktReader<R>,
    data: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> Scanner<'_, R> {
    async fn more(&mut self) -> Result<()> {
        if self.reader.read_raw(&mut self.data).await? == 0 {
            return Err(Error::Transport("truncated packfile".into()));
        }
        Ok(())
    }

    async fn need(&mut self, n: usize) -> Result<()> {
        while self.data.len() < self.pos + n {
            self.more().await?;
        }
        Ok(())
    }

    async fn byte(&mut self) -> Result<u8> {
        self.need(1).await?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Skip over one entry: type/size header, delta base, deflated body
    async fn skip_entry(&mut self, inflate: &mut Decompress, scratch: &mut [u8]) -> Result<()> {
        let mut b = self.byte().await?;
        let kind = (b >> 4) & 0x07;
        while b & 0x80 != 0 {
            b = self.byte().await?;
        }

        match kind {
            OBJ_OFS_DELTA => {
                let mut b = self.byte().await?;
                while b & 0x80 != 0 {
                    b = self.byte().await?;
                }
            }
            OBJ_REF_DELTA => {
                self.need(20).await?;
                self.pos += 20;
            }
            1..=4 => {}
            other => return Err(Error::Transport(format!("invalid pack object type {other}"))),
        }

        inflate.reset(true);
        loop {
            if self.pos == self.data.len() {
                self.more().await?;
            }
            let (in_before, out_before) = (inflate.total_in(), inflate.total_out());
            let status = inflate
                .decompress(&self.data[self.pos..], scratch, FlushDecompress::None)
                .map_err(|e| Error::Transport(format!("corrupt packfile: {e}")))?;
            let consumed = (inflate.total_in() - in_before) as usize;
            let produced = inflate.total_out() - out_before;
            self.pos += consumed;

            match status {
                Status::StreamEnd => return Ok(()),
                _ if consumed == 0 && produced == 0 => self.more().await?,
                _ => {}
            }
        }
    }
}

/// Read exactly one packfile from the reader and return its bytes. Anything
/// the reader buffered past the trailer is discarded.
pub async fn read_pack<R: AsyncRead + Unpin>(reader: &mut PktReader<R>) -> Result<Vec<u8>> {
    let mut scanner = Scanner {
        reader,
        data: Vec::new(),
        pos: 0,
    };

    scanner.need(HEADER_LEN).await?;
    let header = PackHeader::parse(&scanner.data)?;
    scanner.pos = HEADER_LEN;

    let mut inflate = Decompress::new(true);
    let mut scratch = vec![0u8; 64 * 1024];
    for _ in 0..header.objects {
        scanner.skip_entry(&mut inflate, &mut scratch).await?;
    }

    scanner.need(TRAILER_LEN).await?;
    let end = scanner.pos + TRAILER_LEN;
    let mut data = scanner.data;
    data.truncate(end);

    tracing::debug!(objects = header.objects, bytes = data.len(), "received packfile");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};

    /// Build a pack with two commits so it contains both full objects and
    /// (usually) deltas.
    fn sample_pack() -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();

        let mut parent = None;
        for i in 0..2 {
            let content = format!("line\n{}\n", "x".repeat(200 * (i + 1)));
            let blob = repo.blob(content.as_bytes()).unwrap();
            let mut tree = repo.treebuilder(None).unwrap();
            tree.insert("README", blob, 0o100644).unwrap();
            let tree = repo.find_tree(tree.write().unwrap()).unwrap();
            let parents: Vec<git2::Commit> = parent.iter().map(|id| repo.find_commit(*id).unwrap()).collect();
            let refs: Vec<&git2::Commit> = parents.iter().collect();
            let id = repo.commit(None, &sig, &sig, &format!("commit {i}"), &tree, &refs).unwrap();
            parent = Some(id);
        }

        let mut walk = repo.revwalk().unwrap();
        walk.push(parent.unwrap()).unwrap();
        let mut builder = repo.packbuilder().unwrap();
        builder.insert_walk(&mut walk).unwrap();
        let mut buf = git2::Buf::new();
        builder.write_buf(&mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn reads_exactly_one_pack() {
        let pack = sample_pack();
        assert_eq!(&pack[..4], b"PACK");

        let mut stream = pack.clone();
        stream.extend_from_slice(b"trailing bytes");
        let mut reader = PktReader::new(stream.as_slice());

        let read = read_pack(&mut reader).await.unwrap();
        assert_eq!(read, pack);
        assert_eq!(PackHeader::parse(&read).unwrap().objects, 6);
    }

    #[tokio::test]
    async fn empty_pack() {
        let mut pack = b"PACK\x00\x00\x00\x02\x00\x00\x00\x00".to_vec();
        pack.extend_from_slice(&[0u8; 20]);
        let mut reader = PktReader::new(pack.as_slice());
        assert_eq!(read_pack(&mut reader).await.unwrap(), pack);
    }

    #[tokio::test]
    async fn truncated_pack_is_a_transport_error() {
        let pack = sample_pack();
        let cut = &pack[..pack.len() / 2];
        let mut reader = PktReader::new(cut);
        assert!(matches!(read_pack(&mut reader).await, Err(Error::Transport(_))));
    }

    #[test]
    fn header_requires_signature() {
        assert!(PackHeader::parse(b"KCAP\x00\x00\x00\x02\x00\x00\x00\x00").is_err());
        assert!(PackHeader::parse(b"PACK\x00\x00\x00\x09\x00\x00\x00\x00").is_err());
        assert_eq!(
            PackHeader::parse(b"PACK\x00\x00\x00\x02\x00\x00\x00\x03").unwrap(),
            PackHeader { version: 2, objects: 3 }
        );
    }
}
