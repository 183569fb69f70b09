// 代理连接模块
// 支持 HTTP CONNECT、SOCKS4 和 SOCKS5 代理

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::SshError;

/// 解析代理地址（IP:PORT 或 DNS 名称）
fn resolve_proxy_addr(host: &str, port: u16) -> Result<SocketAddr, SshError> {
    let proxy_addr = format!("{}:{}", host, port);
    proxy_addr.parse().or_else(|_| {
        use std::net::ToSocketAddrs;
        proxy_addr
            .to_socket_addrs()
            .map_err(|e| SshError::Proxy(format!("Failed to resolve proxy address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::Proxy("No valid proxy address found".to_string()))
    })
}

/// 通过 SOCKS5 代理连接
pub async fn connect_socks5(
    proxy_host: &str,
    proxy_port: u16,
    auth: Option<&(String, String)>,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks5Stream;

    let proxy_addr = resolve_proxy_addr(proxy_host, proxy_port)?;
    let target = (target_host, target_port);

    let stream = if let Some((username, password)) = auth {
        // 带认证的 SOCKS5 连接
        timeout(
            connect_timeout,
            Socks5Stream::connect_with_password(proxy_addr, target, username, password),
        )
        .await
        .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
        .map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("authentication") || err_str.contains("auth") {
                SshError::Proxy(format!("SOCKS5 proxy authentication failed: {}", e))
            } else {
                SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e))
            }
        })?
    } else {
        // 无认证的 SOCKS5 连接
        timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
            .map_err(|e| SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e)))?
    };

    Ok(stream.into_inner())
}

/// 通过 SOCKS4 代理连接
///
/// SOCKS4 没有密码鉴别，只有可选的 user-id 字段。
pub async fn connect_socks4(
    proxy_host: &str,
    proxy_port: u16,
    user_id: Option<&str>,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks4Stream;

    let proxy_addr = resolve_proxy_addr(proxy_host, proxy_port)?;
    let target = (target_host, target_port);

    let stream = if let Some(user_id) = user_id {
        timeout(
            connect_timeout,
            Socks4Stream::connect_with_userid(proxy_addr, target, user_id),
        )
        .await
        .map_err(|_| SshError::Proxy("SOCKS4 proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("SOCKS4 proxy connection failed: {}", e)))?
    } else {
        timeout(connect_timeout, Socks4Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| SshError::Proxy("SOCKS4 proxy connection timeout".to_string()))?
            .map_err(|e| SshError::Proxy(format!("SOCKS4 proxy connection failed: {}", e)))?
    };

    Ok(stream.into_inner())
}

/// 通过 HTTP CONNECT 代理连接
pub async fn connect_http(
    proxy_host: &str,
    proxy_port: u16,
    auth: Option<&(String, String)>,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};

    let proxy_addr = resolve_proxy_addr(proxy_host, proxy_port)?;

    // 先建立到代理的 TCP 连接
    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| SshError::Proxy("HTTP proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("Failed to connect to HTTP proxy: {}", e)))?;

    // 发送 HTTP CONNECT 请求建立隧道
    if let Some((username, password)) = auth {
        // 带认证
        timeout(
            connect_timeout,
            http_connect_tokio_with_basic_auth(
                &mut stream,
                target_host,
                target_port,
                username,
                password,
            ),
        )
        .await
        .map_err(|_| SshError::Proxy("HTTP CONNECT tunnel timeout".to_string()))?
        .map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("407") || err_str.contains("Proxy Authentication Required") {
                SshError::Proxy("HTTP proxy authentication failed (407)".to_string())
            } else {
                SshError::Proxy(format!("HTTP CONNECT tunnel failed: {}", e))
            }
        })?;
    } else {
        // 无认证
        timeout(
            connect_timeout,
            http_connect_tokio(&mut stream, target_host, target_port),
        )
        .await
        .map_err(|_| SshError::Proxy("HTTP CONNECT tunnel timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("HTTP CONNECT tunnel failed: {}", e)))?;
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_numeric_addr() {
        let addr = resolve_proxy_addr("127.0.0.1", 1080).unwrap();
        assert_eq!(addr.port(), 1080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn resolves_localhost_name() {
        let addr = resolve_proxy_addr("localhost", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn refused_proxy_is_a_proxy_error() {
        // 端口 1 上没有代理在监听
        let err = connect_http(
            "127.0.0.1",
            1,
            None,
            "example.com",
            22,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SshError::Proxy(_)));
    }
}
