//! Envelope transport helpers.
//!
//! One envelope per TCP connection: the requester writes the JSON bytes,
//! half-closes its write side, and reads the response to EOF. The
//! responder mirrors that: read to EOF, dispatch, write, close. UDP
//! carries one envelope per datagram and never answers.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use splitlink_core::{Request, Response};

/// Upper bound on a single envelope. Generous: the largest legitimate
/// envelope is one armored packet block plus JSON overhead.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Issue one request over a fresh TCP connection and await the response.
pub async fn request(addr: &str, req: &Request) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to {addr} failed"))?;

    let bytes = req.encode().context("request encode failed")?;
    stream
        .write_all(&bytes)
        .await
        .with_context(|| format!("write to {addr} failed"))?;
    stream.shutdown().await.context("write-side shutdown failed")?;

    let body = read_envelope(&mut stream).await?;
    let response = Response::decode(&body).context("malformed response envelope")?;
    Ok(response)
}

/// Fire one request as a UDP datagram. No response is expected.
pub async fn send_datagram(socket: &UdpSocket, addr: &str, req: &Request) -> Result<()> {
    let bytes = req.encode().context("request encode failed")?;
    let sent = socket
        .send_to(&bytes, addr)
        .await
        .with_context(|| format!("sendto {addr} failed"))?;
    if sent != bytes.len() {
        bail!("short datagram send: {sent} of {} bytes", bytes.len());
    }
    Ok(())
}

/// Read one envelope: everything until the peer half-closes, bounded by
/// [`MAX_ENVELOPE_BYTES`].
pub async fn read_envelope(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await.context("envelope read failed")?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
        if body.len() > MAX_ENVELOPE_BYTES {
            bail!("envelope exceeds {MAX_ENVELOPE_BYTES} bytes");
        }
    }
    Ok(body)
}

/// Write a response and close the connection.
pub async fn respond(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let bytes = response.encode().context("response encode failed")?;
    stream.write_all(&bytes).await.context("response write failed")?;
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitlink_core::envelope::Plain;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_response_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = read_envelope(&mut stream).await.unwrap();
            let req = Request::decode(&body).unwrap();
            respond(&mut stream, &Response::ok(req.request_id()))
                .await
                .unwrap();
        });

        let response = request(
            &addr,
            &Request::SourceEnd(Plain {
                request_id: "req-net".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.request_id, "req-net");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        // Bind and immediately drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = request(
            &addr,
            &Request::SourceEnd(Plain {
                request_id: "req-refused".into(),
            }),
        )
        .await;
        assert!(result.is_err());
    }
}
