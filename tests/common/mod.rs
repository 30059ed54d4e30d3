//! 集成测试共用的小工具：一次性 HTTP 服务、PNG 样本、回调收集。

#![allow(dead_code)]

use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use image_loader_core::operation::CompletionHandler;
use image_loader_core::{LoadCompletion, LoaderConfig};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// 允许访问本机、关闭进度节流，渐进解码只按增长比例限流。
pub fn test_config() -> LoaderConfig {
    LoaderConfig {
        allow_private_network: true,
        throttle_progress: false,
        progressive_min_bytes_delta: 0,
        progressive_min_interval_ms: 0,
        ..LoaderConfig::default()
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 128, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(pixels)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png fixture");
    out.into_inner()
}

/// 带细节的基线 JPEG，截断的前缀也能解出部分扫描行。
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbImage::from_fn(width, height, |x, y| {
        let v = ((x * 7) ^ (y * 13)) as u8;
        image::Rgb([v, v.wrapping_mul(3), (x + y) as u8])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&pixels)
        .expect("encode jpeg fixture");
    out
}

pub fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n", status, body.len());
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// 按连接顺序依次返回预置响应的本地 HTTP 服务。
pub struct TestServer {
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
        let port = listener.local_addr().expect("read local addr failed").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let handle = thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .expect("set read timeout");

                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                seen.lock()
                    .expect("requests lock")
                    .push(String::from_utf8_lossy(&request).to_string());

                let _ = stream.write_all(&response);
                let _ = stream.flush();
            }
        });

        Self {
            port,
            requests,
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// 等服务线程处理完全部预置响应后返回收到的请求原文。
    pub fn finish(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("server thread failed");
        }
        self.requests.lock().expect("requests lock").clone()
    }
}

/// 把完成回调转成 channel。
pub fn completion_channel() -> (CompletionHandler, UnboundedReceiver<LoadCompletion>) {
    let (tx, rx) = unbounded_channel();
    let handler: CompletionHandler = Box::new(move |completion| {
        let _ = tx.send(completion);
    });
    (handler, rx)
}

pub async fn next_completion(rx: &mut UnboundedReceiver<LoadCompletion>) -> LoadCompletion {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for completion")
        .expect("completion channel closed without an event")
}

/// 读到终态事件为止，返回之前的中间帧与终态事件。
pub async fn until_final(rx: &mut UnboundedReceiver<LoadCompletion>) -> (Vec<LoadCompletion>, LoadCompletion) {
    let mut partials = Vec::new();
    loop {
        let completion = next_completion(rx).await;
        if completion.is_final {
            return (partials, completion);
        }
        partials.push(completion);
    }
}

/// 终态之后回调应被释放，channel 随之关闭且没有更多事件。
pub async fn assert_no_more_events(rx: &mut UnboundedReceiver<LoadCompletion>) {
    let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion handler should be released after the final event");
    assert!(next.is_none(), "unexpected event after final: {:?}", next);
}
