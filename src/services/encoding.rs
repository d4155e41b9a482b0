// src/services/encoding.rs

//! Response body decompression.
//!
//! Both clients advertise `gzip, deflate, br, zstd` and decode the body
//! themselves so that the emitted `Response` always carries plain bytes.

use std::io::Read;

use crate::error::{AppError, Result};

/// Decode `body` according to its `Content-Encoding` value. An empty or
/// unknown encoding passes the bytes through untouched.
pub fn decode_body(encoding: &str, body: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut decoded = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut decoded)
                .map_err(AppError::body_read)?;
            Ok(decoded)
        }
        "deflate" => {
            let mut decoded = Vec::new();
            flate2::read::ZlibDecoder::new(body)
                .read_to_end(&mut decoded)
                .map_err(AppError::body_read)?;
            Ok(decoded)
        }
        "br" => {
            let mut decoded = Vec::new();
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut decoded)
                .map_err(AppError::body_read)?;
            Ok(decoded)
        }
        "zstd" => zstd::stream::decode_all(body).map_err(AppError::body_read),
        _ => Ok(body.to_vec()),
    }
}
