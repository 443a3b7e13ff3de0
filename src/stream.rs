//! 非同期I/Oトレイト
//!
//! monoioのrent型API（バッファの所有権を渡して返してもらう）を
//! ストリーム型の違いから切り離すための小さな抽象です。プレーンTCPと
//! オリジン向けTLSの両方に実装します。

use std::io;

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio_rustls::ClientTlsStream;

/// 非同期読み込みトレイト
pub trait AsyncReader {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
}

/// 非同期書き込みトレイト
pub trait AsyncWriter {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
}

impl AsyncReader for TcpStream {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }
}

impl AsyncWriter for TcpStream {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}

impl AsyncReader for ClientTlsStream<TcpStream> {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }
}

impl AsyncWriter for ClientTlsStream<TcpStream> {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}

/// テストおよびバッファリング用: Vecへの書き込み
impl AsyncWriter for Vec<u8> {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.extend_from_slice(&buf);
        (Ok(buf.len()), buf)
    }
}
