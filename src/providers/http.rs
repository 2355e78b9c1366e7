//! Shared HTTP response handling
//!
//! Bodies are read as bytes and decompressed according to `Content-Encoding`
//! before any JSON decoding, so vendors that compress regardless of
//! `Accept-Encoding` still decode.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use reqwest::header::CONTENT_ENCODING;
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::io::Read;

use crate::error::Error;
use crate::Result;

/// Read a response body, undoing `gzip`/`deflate` content encoding
pub async fn read_body(response: Response) -> Result<Vec<u8>> {
    let encoding = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());
    let bytes = response.bytes().await?;
    decompress(encoding.as_deref(), &bytes)
}

/// Decompress `bytes` for the given `Content-Encoding` value
pub fn decompress(encoding: Option<&str>, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        Some("gzip") | Some("x-gzip") => {
            GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| Error::DecodeFailed(format!("gzip body: {e}")))?;
        }
        // "deflate" is zlib-wrapped per RFC 9110, but some servers send raw deflate
        Some("deflate") => {
            if ZlibDecoder::new(bytes).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::DecodeFailed(format!("deflate body: {e}")))?;
            }
        }
        _ => out.extend_from_slice(bytes),
    }
    Ok(out)
}

/// Decompress and deserialize a JSON body
pub async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = read_body(response).await?;
    serde_json::from_slice(&body).map_err(|e| Error::DecodeFailed(e.to_string()))
}

/// Status code and decompressed text of a (failed) response
pub async fn status_and_text(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let text = match read_body(response).await {
        Ok(body) => String::from_utf8_lossy(&body).into_owned(),
        Err(e) => e.to_string(),
    };
    (status, text)
}

/// Pass 2xx responses through; turn anything else into `ProviderRequestFailed`
pub async fn ensure_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, body) = status_and_text(response).await;
    tracing::debug!("Provider request failed with {}: {}", status, body);
    Err(Error::ProviderRequestFailed { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(decompress(None, b"{}").unwrap(), b"{}");
        assert_eq!(decompress(Some("identity"), b"{}").unwrap(), b"{}");
    }

    #[test]
    fn test_gzip() {
        let body = gzip(br#"{"ok":true}"#);
        assert_eq!(decompress(Some("gzip"), &body).unwrap(), br#"{"ok":true}"#);
    }

    #[test]
    fn test_deflate_zlib_and_raw() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(b"hello").unwrap();
        let zlib = zlib.finish().unwrap();
        assert_eq!(decompress(Some("deflate"), &zlib).unwrap(), b"hello");

        let mut raw = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        raw.write_all(b"hello").unwrap();
        let raw = raw.finish().unwrap();
        assert_eq!(decompress(Some("deflate"), &raw).unwrap(), b"hello");
    }

    #[test]
    fn test_corrupt_gzip_is_decode_error() {
        assert!(matches!(
            decompress(Some("gzip"), b"not gzip"),
            Err(Error::DecodeFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_gzipped_json_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/data")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_header("content-type", "application/json")
            .with_body(gzip(br#"{"value":42}"#))
            .create_async()
            .await;

        let response = reqwest::get(format!("{}/data", server.url())).await.unwrap();
        let value: serde_json::Value = decode_json(response).await.unwrap();
        assert_eq!(value["value"], 42);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_success_maps_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fail")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let response = reqwest::get(format!("{}/fail", server.url())).await.unwrap();
        match ensure_success(response).await {
            Err(Error::ProviderRequestFailed { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
