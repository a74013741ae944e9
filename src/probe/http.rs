use super::ProbeTimeouts;
use crate::error::{MirrorError, Result};
use crate::traits::{Download, EndpointProbe, Probed};
use crate::utils::{join_url, strip_known_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{LAST_MODIFIED, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Response};
use std::time::{Duration, Instant};

/// Redirects followed per request before the endpoint is given up.
pub const MAX_REDIRECTS: usize = 3;

pub struct HttpProbe {
    client: Client,
    timeouts: ProbeTimeouts,
}

impl HttpProbe {
    pub fn new(timeouts: ProbeTimeouts) -> Result<Self> {
        // 自己处理重定向, 以便记录新的 base URL
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .redirect(Policy::none())
            .user_agent(concat!("repomirror/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, timeouts })
    }

    /// Send a request for `path` below `base`, following redirects by hand.
    ///
    /// Returns the successful response and the base URL that produced it.
    async fn send(&self, method: Method, base: &str, path: &str, timeout: Duration) -> Result<(Response, String)> {
        let mut base = base.trim_end_matches('/').to_string();

        for _ in 0..=MAX_REDIRECTS {
            let url = join_url(&base, path);
            let resp = self
                .client
                .request(method.clone(), &url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| MirrorError::Transport(format!("{}: {}", url, e)))?;

            let status = resp.status();
            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        MirrorError::Transport(format!("{} redirected without a Location", url))
                    })?;
                let target = resp
                    .url()
                    .join(location)
                    .map_err(|e| MirrorError::Transport(format!("{}: bad Location: {}", url, e)))?;

                base = strip_known_path(target.as_str(), path).ok_or_else(|| {
                    MirrorError::Transport(format!("{} redirected outside the mirror to {}", url, target))
                })?;
                tracing::debug!("{} redirected, new base {}", url, base);
                continue;
            }

            if !status.is_success() {
                return Err(MirrorError::Transport(format!("{} returned {}", url, status)));
            }

            return Ok((resp, base));
        }

        Err(MirrorError::Transport(format!(
            "{}: more than {} redirects",
            join_url(&base, path),
            MAX_REDIRECTS
        )))
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn remote_mtime(&self, base: &str, path: &str) -> Result<Probed<DateTime<Utc>>> {
        let (resp, base) = self.send(Method::HEAD, base, path, self.timeouts.read).await?;

        let header = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| MirrorError::Transport(format!("{}: no Last-Modified header", base)))?;

        let value = DateTime::parse_from_rfc2822(header)
            .map_err(|e| MirrorError::Transport(format!("{}: bad Last-Modified '{}': {}", base, header, e)))?
            .with_timezone(&Utc);

        Ok(Probed { value, base })
    }

    async fn download(&self, base: &str, path: &str) -> Result<Probed<Download>> {
        let start = Instant::now();
        let (mut resp, base) = self.send(Method::GET, base, path, self.timeouts.download).await?;

        // 逐块读取, 不把整个文件放进内存
        let mut bytes = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| MirrorError::Transport(format!("{}: {}", base, e)))?
        {
            bytes += chunk.len() as u64;
        }

        Ok(Probed {
            value: Download {
                bytes,
                elapsed: start.elapsed(),
            },
            base,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per accepted connection, in order.
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for body in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(body.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    fn probe() -> HttpProbe {
        HttpProbe::new(ProbeTimeouts::from_settings(&Settings::default())).unwrap()
    }

    #[tokio::test]
    async fn test_last_modified_is_parsed() {
        let base = serve(vec![
            "HTTP/1.1 200 OK\r\nLast-Modified: Wed, 01 May 2024 10:00:00 GMT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;

        let probed = probe().remote_mtime(&base, "lastsync").await.unwrap();

        assert_eq!(probed.value.timestamp(), 1_714_557_600);
        assert_eq!(probed.base, base);
    }

    #[tokio::test]
    async fn test_redirect_rewrites_base() {
        let base = serve(vec![
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /moved/distro/lastsync\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
            "HTTP/1.1 200 OK\r\nLast-Modified: Wed, 01 May 2024 10:00:00 GMT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;

        let probed = probe().remote_mtime(&base, "lastsync").await.unwrap();

        assert_eq!(probed.base, format!("{}/moved/distro", base));
    }

    #[tokio::test]
    async fn test_missing_last_modified_fails() {
        let base = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;

        let err = probe().remote_mtime(&base, "lastsync").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_not_found_fails() {
        let base = serve(vec![
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;

        let err = probe().remote_mtime(&base, "lastsync").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_download_counts_bytes() {
        let body = "x".repeat(2048);
        let base = serve(vec![format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )])
        .await;

        let probed = probe().download(&base, "core.db").await.unwrap();
        assert_eq!(probed.value.bytes, 2048);
    }

    #[tokio::test]
    async fn test_redirect_limit() {
        let hop = |n: usize| {
            format!(
                "HTTP/1.1 301 Moved Permanently\r\nLocation: /hop{}/lastsync\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                n
            )
        };
        let base = serve((0..=MAX_REDIRECTS).map(hop).collect()).await;

        let err = probe().remote_mtime(&base, "lastsync").await.unwrap_err();

        assert!(err.is_transport());
        assert!(err.to_string().contains("more than 3 redirects"), "{}", err);
    }

    #[tokio::test]
    async fn test_redirect_off_path_fails() {
        let base = serve(vec![
            "HTTP/1.1 302 Found\r\nLocation: /maintenance.html\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;

        let err = probe().remote_mtime(&base, "lastsync").await.unwrap_err();

        assert!(err.is_transport());
        assert!(err.to_string().contains("redirected outside the mirror"), "{}", err);
    }
}
