//! Structural validation of NAR archives.
//!
//! The garbage collector re-reads every stored NAR through the
//! assembler to decide whether its index is still worth keeping. We
//! don't need to materialize the tree for that, only to prove the
//! bytes still parse as an archive: correct magic, well-formed nodes,
//! and clean EOF exactly at the end.
//!
//! A NAR is a stream of length-prefixed, zero-padded strings. The
//! grammar (from the Nix thesis, figure 5.2):
//!
//! ```text
//! archive   ::= "nix-archive-1" node
//! node      ::= "(" "type" spec ")"
//! spec      ::= "regular" [ "executable" "" ] "contents" contents
//!             | "symlink" "target" target
//!             | "directory" entry*
//! entry     ::= "entry" "(" "name" name "node" node ")"
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest token we ever expect ("nix-archive-1").
const MAX_TOKEN_LEN: u64 = 13;

/// Maximum length of an entry name.
const MAX_NAME_LEN: u64 = 255;

/// Maximum length of a symlink target.
const MAX_TARGET_LEN: u64 = 4095;

/// Validates a NAR archive, returning the number of nodes.
///
/// The reader must be positioned at the start of the archive and is
/// consumed up to (and including) the expected EOF. Trailing bytes
/// after the root node are an error.
pub async fn validate_nar<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    expect_token(reader, b"nix-archive-1").await?;

    let nodes = walk_node(reader).await?;

    // nothing may follow the root node
    let mut scratch = [0u8; 1];
    match reader.read(&mut scratch).await? {
        0 => Ok(nodes),
        _ => Err(invalid("trailing bytes after the root node")),
    }
}

/// Walks one node, returning the number of nodes beneath it (inclusive).
fn walk_node<'a, R>(reader: &'a mut R) -> Pin<Box<dyn Future<Output = io::Result<u64>> + Send + 'a>>
where
    R: AsyncRead + Unpin + Send,
{
    Box::pin(async move {
        expect_token(reader, b"(").await?;
        expect_token(reader, b"type").await?;

        let node_type = read_string(reader, MAX_TOKEN_LEN).await?;

        let mut nodes = 1u64;

        match node_type.as_slice() {
            b"regular" => {
                let mut token = read_string(reader, MAX_TOKEN_LEN).await?;

                if token == b"executable" {
                    // the marker is followed by an empty string
                    expect_token(reader, b"").await?;
                    token = read_string(reader, MAX_TOKEN_LEN).await?;
                }

                if token != b"contents" {
                    return Err(invalid("expected file contents"));
                }

                let len = read_u64(reader).await?;
                skip_exact(reader, len).await?;
                read_padding(reader, len).await?;

                expect_token(reader, b")").await?;
            }
            b"symlink" => {
                expect_token(reader, b"target").await?;

                let target = read_string(reader, MAX_TARGET_LEN).await?;
                if target.is_empty() || target.contains(&0) {
                    return Err(invalid("bad symlink target"));
                }

                expect_token(reader, b")").await?;
            }
            b"directory" => loop {
                let token = read_string(reader, MAX_TOKEN_LEN).await?;

                match token.as_slice() {
                    b")" => break,
                    b"entry" => {
                        expect_token(reader, b"(").await?;
                        expect_token(reader, b"name").await?;

                        let name = read_string(reader, MAX_NAME_LEN).await?;
                        if name.is_empty()
                            || name == b"."
                            || name == b".."
                            || name.contains(&0)
                            || name.contains(&b'/')
                        {
                            return Err(invalid("bad entry name"));
                        }

                        expect_token(reader, b"node").await?;
                        nodes += walk_node(reader).await?;
                        expect_token(reader, b")").await?;
                    }
                    _ => return Err(invalid("unexpected token in directory")),
                }
            },
            _ => return Err(invalid("unknown node type")),
        }

        Ok(nodes)
    })
}

/// Reads a length-prefixed, zero-padded string.
async fn read_string<R>(reader: &mut R, max_len: u64) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let len = read_u64(reader).await?;
    if len > max_len {
        return Err(invalid("string exceeds maximum length"));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    read_padding(reader, len).await?;

    Ok(buf)
}

/// Reads a string and requires it to equal a token.
async fn expect_token<R>(reader: &mut R, token: &[u8]) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let read = read_string(reader, token.len().max(MAX_TOKEN_LEN as usize) as u64).await?;

    if read != token {
        return Err(invalid("unexpected token"));
    }

    Ok(())
}

async fn read_u64<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Consumes the zero padding aligning a `len`-byte string to 8 bytes.
async fn read_padding<R>(reader: &mut R, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let pad = (8 - len % 8) % 8;
    if pad == 0 {
        return Ok(());
    }

    let mut buf = [0u8; 8];
    let buf = &mut buf[..pad as usize];
    reader.read_exact(buf).await?;

    if buf.iter().any(|b| *b != 0) {
        return Err(invalid("non-zero padding"));
    }

    Ok(())
}

/// Discards exactly `len` bytes.
async fn skip_exact<R>(reader: &mut R, mut len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut scratch = [0u8; 8192];

    while len > 0 {
        let want = scratch.len().min(len as usize);
        let read = reader.read(&mut scratch[..want]).await?;

        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "NAR file contents truncated",
            ));
        }

        len -= read as u64;
    }

    Ok(())
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
