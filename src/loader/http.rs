//! # HTTP(S) 加载器
//!
//! ## 设计思路
//!
//! 网络来源最容易出问题：慢、重定向、假冒的 Content-Type、超大响应、内网探测。
//! 这里在“尽可能早”的阶段拒绝不合格的请求，剩下的字节交给驱动器。
//!
//! ## 实现思路
//!
//! - 重定向手动跟随（客户端关闭自动重定向），每一跳都重新做主机安全检查。
//! - 禁止内网时，域名先用 `lookup_host` 解析，任一结果落在内网即拒绝；
//!   通过校验的地址绑定到这一跳专用的客户端上，连接时不会再次解析。
//! - 有刷新提示时带上 `If-None-Match` / `If-Modified-Since`，`304` 视为未变化。
//! - 流式读取：首包与分块分别计时，超时即失败。
//! - 日志里的 URL 一律去掉查询串与片段。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap};
use reqwest::{Client, ClientBuilder, Response, StatusCode, Url};
use tokio::net::lookup_host;

use super::{ImageLoader, LoadEnvironment};
use crate::config::LoaderConfig;
use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::{CacheValidator, CachedImage};
use crate::operation::{CompletionHandler, LoadOperation, OperationDriver, ProgressHandler, TransferOutcome};

const ACCEPT_IMAGES: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

/// 基于 reqwest 的网络图片加载器。
pub struct HttpLoader {
    env: LoadEnvironment,
    client: Client,
}

impl HttpLoader {
    pub fn new(env: LoadEnvironment) -> Result<Self, LoadError> {
        let client = Self::build_client(env.config())?;
        Ok(Self { env, client })
    }

    fn build_client(config: &LoaderConfig) -> Result<Client, LoadError> {
        Self::client_builder(config)
            .build()
            .map_err(|e| LoadError::InvalidConfig(format!("无法创建 HTTP 客户端：{}", e)))
    }

    fn client_builder(config: &LoaderConfig) -> ClientBuilder {
        Client::builder()
            .timeout(Duration::from_secs(config.download_timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
    }

    /// 为一跳请求挑选客户端：需要校验 DNS 时返回绑定了公网解析结果的新客户端。
    async fn client_for_target(base: &Client, url: &Url, config: &LoaderConfig) -> Result<Client, LoadError> {
        check_target(url, config)?;

        if config.allow_private_network || !config.resolve_dns_for_url_safety {
            return Ok(base.clone());
        }

        let Some(host) = url.host_str() else {
            return Ok(base.clone());
        };
        if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
            return Ok(base.clone());
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| LoadError::InvalidLocator("URL 缺少端口信息".to_string()))?;
        let resolved: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| LoadError::TransferFailed(format!("URL 主机解析失败：{}", e)))?
            .collect();
        let pinned = public_addrs(host, resolved)?;

        Self::client_builder(config)
            .resolve_to_addrs(host, &pinned)
            .build()
            .map_err(|e| LoadError::TransferFailed(format!("无法创建 DNS 绑定客户端：{}", e)))
    }

    async fn transfer(
        client: &Client,
        driver: &mut OperationDriver,
        config: &LoaderConfig,
    ) -> Result<TransferOutcome, LoadError> {
        let locator = driver.locator().clone();
        log::info!("🌐 开始下载图片 - URL: {}", locator.redacted());

        let conditional = driver.refresh_hint().map(conditional_headers).unwrap_or_default();
        let mut response = Self::send_following_redirects(client, locator.url(), conditional, config).await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(TransferOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(LoadError::TransferFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status_message(status.as_u16())
            )));
        }

        if let Some(content_type) = header_text(response.headers(), header::CONTENT_TYPE) {
            if !is_image_content_type(&content_type) {
                return Err(LoadError::DecodeFailed(format!("不是图片类型：{}", content_type)));
            }
        }

        let validator = CacheValidator {
            etag: header_text(response.headers(), header::ETAG),
            last_modified: header_text(response.headers(), header::LAST_MODIFIED),
        };
        let total_len =
            header_text(response.headers(), header::CONTENT_LENGTH).and_then(|len| len.parse::<u64>().ok());

        driver.begin(total_len)?;
        Self::stream_body(&mut response, driver, config).await?;

        log::debug!("✅ 下载完成 - {} bytes", driver.received());
        Ok(TransferOutcome::Completed { validator })
    }

    async fn send_following_redirects(
        client: &Client,
        start: &Url,
        conditional: HeaderMap,
        config: &LoaderConfig,
    ) -> Result<Response, LoadError> {
        let mut current = start.clone();

        for redirect_count in 0..=config.max_redirects {
            let hop_client = Self::client_for_target(client, &current, config).await?;

            let response = hop_client
                .get(current.clone())
                .header(header::ACCEPT, ACCEPT_IMAGES)
                .headers(conditional.clone())
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, config))?;

            let status = response.status();
            if status == StatusCode::NOT_MODIFIED || !status.is_redirection() {
                return Ok(response);
            }

            if redirect_count >= config.max_redirects {
                break;
            }

            let location = header_text(response.headers(), header::LOCATION)
                .ok_or_else(|| LoadError::TransferFailed("重定向响应缺少 Location 头".to_string()))?;
            let next = current
                .join(&location)
                .map_err(|e| LoadError::TransferFailed(format!("重定向 URL 解析失败：{}", e)))?;

            log::debug!("↪️ 跳转到: {}", Locator::from_url(next.clone()).redacted());
            current = next;
        }

        Err(LoadError::TransferFailed(format!(
            "重定向次数超过限制（{}）",
            config.max_redirects
        )))
    }

    async fn stream_body(
        response: &mut Response,
        driver: &mut OperationDriver,
        config: &LoaderConfig,
    ) -> Result<(), LoadError> {
        let mut received_first_chunk = false;

        loop {
            let read_timeout = if received_first_chunk {
                Duration::from_millis(config.stream_chunk_timeout_ms)
            } else {
                Duration::from_millis(config.stream_first_byte_timeout_ms)
            };

            let next = tokio::time::timeout(read_timeout, response.chunk())
                .await
                .map_err(|_| {
                    if received_first_chunk {
                        LoadError::TransferFailed("下载数据流读取超时".to_string())
                    } else {
                        LoadError::TransferFailed("下载首包超时".to_string())
                    }
                })?;

            let Some(chunk) = next.map_err(|e| map_reqwest_error(e, config))? else {
                return Ok(());
            };

            received_first_chunk = true;
            driver.receive(&chunk).await?;
        }
    }
}

impl ImageLoader for HttpLoader {
    fn can_load(&self, locator: &Locator) -> bool {
        matches!(locator.scheme(), "http" | "https")
    }

    fn load(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
    ) -> LoadOperation {
        let client = self.client.clone();
        let config = Arc::clone(self.env.config());

        self.env
            .spawn(locator, options, context, progress, completed, move |mut driver| async move {
                let operation = driver.operation().clone();
                let outcome = tokio::select! {
                    outcome = Self::transfer(&client, &mut driver, &config) => outcome,
                    _ = operation.cancelled() => Err(LoadError::Cancelled),
                };
                driver.finish(outcome).await;
            })
    }

    fn name(&self) -> &str {
        "HttpLoader"
    }
}

/// 由缓存校验信息构造条件请求头。
fn conditional_headers(hint: &CachedImage) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(value) = hint.validator.etag.as_deref().and_then(|v| v.parse().ok()) {
        headers.insert(header::IF_NONE_MATCH, value);
    }
    if let Some(value) = hint.validator.last_modified.as_deref().and_then(|v| v.parse().ok()) {
        headers.insert(header::IF_MODIFIED_SINCE, value);
    }

    headers
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 默认阻止本地/内网目标，防止 SSRF。
fn check_target(url: &Url, config: &LoaderConfig) -> Result<(), LoadError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(LoadError::InvalidLocator("仅支持 HTTP/HTTPS".to_string()));
    }

    if config.allow_private_network {
        return Ok(());
    }

    let host = url
        .host_str()
        .ok_or_else(|| LoadError::InvalidLocator("URL 缺少主机地址".to_string()))?;

    if is_local_hostname(host) {
        return Err(LoadError::TransferFailed(format!("禁止访问本地网络地址：{}", host)));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(LoadError::TransferFailed(format!("禁止访问内网 IP：{}", ip)));
        }
    }

    Ok(())
}

/// 解析结果必须全部是公网地址；为空也视为失败。
fn public_addrs(host: &str, resolved: Vec<SocketAddr>) -> Result<Vec<SocketAddr>, LoadError> {
    if let Some(private) = resolved.iter().find(|addr| is_private_or_local_ip(addr.ip())) {
        return Err(LoadError::TransferFailed(format!(
            "URL 解析结果命中内网地址：{} -> {}",
            host,
            private.ip()
        )));
    }
    if resolved.is_empty() {
        return Err(LoadError::TransferFailed(format!("URL 未解析到有效公网地址：{}", host)));
    }
    Ok(resolved)
}

fn is_local_hostname(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case("localhost.")
        || host.to_ascii_lowercase().ends_with(".local")
}

/// 本地、内网、链路本地、组播等受限范围。
fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
            {
                return true;
            }

            // 0.0.0.0/8 与运营商级 NAT 100.64.0.0/10
            let octets = v4.octets();
            octets[0] == 0 || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_or_local_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
        }
    }
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|base| {
            let base = base.trim().to_ascii_lowercase();
            base.starts_with("image/") || base == "application/octet-stream"
        })
        .unwrap_or(false)
}

fn map_reqwest_error(e: reqwest::Error, config: &LoaderConfig) -> LoadError {
    let timeout = e.is_timeout();
    let connect = e.is_connect();
    let message = e.without_url().to_string();

    if timeout {
        LoadError::TransferFailed(format!("下载超时（{}秒）", config.download_timeout))
    } else if connect {
        LoadError::TransferFailed(format!("无法连接：{}", message))
    } else {
        LoadError::TransferFailed(format!("请求失败：{}", message))
    }
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        401 => "需要认证",
        410 => "资源已删除",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}
