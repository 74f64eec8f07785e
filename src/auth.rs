//! Shared-secret authentication for the RPC listener: a symmetric HMAC
//! challenge, not a full client identity scheme (DMM's Non-goals explicitly
//! exclude authenticating clients beyond a pre-shared key).

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 32;

fn sign(secret: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Server side: send a random nonce, read back the client's HMAC, and accept
/// only on an exact (constant-time) match. The caller closes the connection
/// without reading the tagged message if this returns `false`.
pub async fn server_challenge<S>(stream: &mut S, secret: &[u8]) -> std::io::Result<bool>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let expected = sign(secret, &nonce);
    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).await?;

    Ok(constant_time_eq(&expected, &received))
}

/// Client side: read the server's nonce and answer with its HMAC.
pub async fn client_respond<S>(stream: &mut S, secret: &[u8]) -> std::io::Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut nonce = [0u8; NONCE_LEN];
    stream.read_exact(&mut nonce).await?;
    let response = sign(secret, &nonce);
    stream.write_all(&response).await?;
    stream.flush().await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Read the authkey file referenced from configuration. A trailing newline
/// (common when the file was created with an editor or `echo`) is trimmed.
pub fn read_authkey(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim_end().as_bytes().to_vec())
}
