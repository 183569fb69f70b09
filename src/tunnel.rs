// 隧道提供器
//
// 把传输获取从连接逻辑中剥离：无论直连、HTTP/SOCKS 代理
// 还是 SSH 跳板机，最终都交付一条可进行 SSH 握手的字节流。
// 跳板机本身是一个完整的 SSH 会话，其主机密钥走与主目标
// 相同的信任库与决议协议。

use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::auth::{self, Authenticator};
use crate::config::{ConnectionProfile, JumpHostConfig, ProxyKind};
use crate::decision::HostKeyResolver;
use crate::error::SshError;
use crate::event::{ConnectionEvent, ConnectionStage, LogEntry};
use crate::handler::ClientHandler;
use crate::known_hosts::TrustStore;
use crate::proxy;

/// 提供器交付的字节流
pub enum TunnelStream {
    /// 直连或代理隧道后的 TCP 流
    Direct(TcpStream),
    /// 跳板机上打开的 direct-tcpip 通道
    Channel(russh::ChannelStream<russh::client::Msg>),
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("TunnelStream::Direct"),
            Self::Channel(_) => f.write_str("TunnelStream::Channel"),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_read(cx, buf),
            Self::Channel(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_write(cx, buf),
            Self::Channel(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_flush(cx),
            Self::Channel(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_shutdown(cx),
            Self::Channel(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// 跳板机会话守卫
///
/// direct-tcpip 通道依赖跳板机会话存活，守卫与主会话同寿命，
/// 关闭主会话时一并断开。
pub struct JumpGuard {
    handle: russh::client::Handle<ClientHandler>,
    host: String,
    port: u16,
}

impl std::fmt::Debug for JumpGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JumpGuard")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl JumpGuard {
    /// 断开跳板机会话
    pub async fn disconnect(&self) {
        debug!("Disconnecting jump host session {}:{}", self.host, self.port);
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// 隧道提供器
pub struct TunnelProvisioner {
    trust: Arc<TrustStore>,
    authenticator: Arc<Authenticator>,
    resolver: Option<Arc<dyn HostKeyResolver>>,
    decision_wait: Duration,
}

impl TunnelProvisioner {
    pub fn new(
        trust: Arc<TrustStore>,
        authenticator: Arc<Authenticator>,
        resolver: Option<Arc<dyn HostKeyResolver>>,
        decision_wait: Duration,
    ) -> Self {
        Self {
            trust,
            authenticator,
            resolver,
            decision_wait,
        }
    }

    /// 按档案的代理配置交付一条到目标主机的字节流
    pub async fn provision(
        &self,
        profile: &ConnectionProfile,
        event_sender: &mpsc::UnboundedSender<ConnectionEvent>,
        rejected: &Arc<AtomicBool>,
        decision_gate: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(TunnelStream, Option<JumpGuard>), SshError> {
        let connect_timeout = profile.connect_timeout();

        match &profile.proxy {
            None => {
                let stream = direct_connect(&profile.host, profile.port, connect_timeout).await?;
                Ok((TunnelStream::Direct(stream), None))
            }
            Some(ProxyKind::Http { host, port, auth }) => {
                let _ = event_sender.send(ConnectionEvent::StageChanged(
                    ConnectionStage::ConnectingProxy,
                ));
                let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
                    "Connecting via HTTP proxy {}:{}",
                    host, port
                ))));
                let stream = proxy::connect_http(
                    host,
                    *port,
                    auth.as_ref(),
                    &profile.host,
                    profile.port,
                    connect_timeout,
                )
                .await?;
                Ok((TunnelStream::Direct(stream), None))
            }
            Some(ProxyKind::Socks4 { host, port, user_id }) => {
                let _ = event_sender.send(ConnectionEvent::StageChanged(
                    ConnectionStage::ConnectingProxy,
                ));
                let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
                    "Connecting via SOCKS4 proxy {}:{}",
                    host, port
                ))));
                let stream = proxy::connect_socks4(
                    host,
                    *port,
                    user_id.as_deref(),
                    &profile.host,
                    profile.port,
                    connect_timeout,
                )
                .await?;
                Ok((TunnelStream::Direct(stream), None))
            }
            Some(ProxyKind::Socks5 { host, port, auth }) => {
                let _ = event_sender.send(ConnectionEvent::StageChanged(
                    ConnectionStage::ConnectingProxy,
                ));
                let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
                    "Connecting via SOCKS5 proxy {}:{}",
                    host, port
                ))));
                let stream = proxy::connect_socks5(
                    host,
                    *port,
                    auth.as_ref(),
                    &profile.host,
                    profile.port,
                    connect_timeout,
                )
                .await?;
                Ok((TunnelStream::Direct(stream), None))
            }
            Some(ProxyKind::SshJump(jump)) => {
                let _ = event_sender.send(ConnectionEvent::StageChanged(
                    ConnectionStage::ConnectingJumpHost,
                ));
                self.connect_via_jump(profile, jump, event_sender, rejected, decision_gate)
                    .await
            }
        }
    }

    /// 通过 SSH 跳板机连接：完整会话 + direct-tcpip 通道
    ///
    /// 任何一步失败都以 JumpHost 错误上抛，由调用方按终态处理；
    /// 半建立的跳板机会话在错误上抛前拆除。
    async fn connect_via_jump(
        &self,
        profile: &ConnectionProfile,
        jump: &JumpHostConfig,
        event_sender: &mpsc::UnboundedSender<ConnectionEvent>,
        rejected: &Arc<AtomicBool>,
        decision_gate: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(TunnelStream, Option<JumpGuard>), SshError> {
        // 凭据先行：缺失凭据时不打开任何网络连接
        let resolved = self.authenticator.resolve_jump(profile, jump).await?;

        let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
            "Connecting to jump host {}@{}:{}",
            jump.username, jump.host, jump.port
        ))));

        let connect_timeout = profile.connect_timeout();
        let tcp = direct_connect(&jump.host, jump.port, connect_timeout)
            .await
            .map_err(|e| {
                SshError::JumpHost(format!(
                    "jump host {}:{} unreachable: {}",
                    jump.host, jump.port, e
                ))
            })?;

        // 跳板机密钥与主目标共享信任库和决策方
        let handler = ClientHandler::new(
            self.trust.clone(),
            self.resolver.clone(),
            self.decision_wait,
            jump.host.clone(),
            jump.port,
            event_sender.clone(),
            rejected.clone(),
            decision_gate.clone(),
        );
        let config = Arc::new(profile.to_russh_config());
        let mut handle = russh::client::connect_stream(config, tcp, handler)
            .await
            .map_err(|e| SshError::JumpHost(format!("jump host handshake failed: {}", e)))?;

        if let Err(e) = auth::apply(&mut handle, &jump.username, &resolved).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(SshError::JumpHost(format!(
                "jump host authentication failed: {}",
                e
            )));
        }
        info!("Jump host session established: {}:{}", jump.host, jump.port);

        let channel = match handle
            .channel_open_direct_tcpip(
                profile.host.clone(),
                profile.port as u32,
                "127.0.0.1",
                0,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await;
                return Err(SshError::JumpHost(format!(
                    "failed to open tunnel to {}:{} via jump host: {}",
                    profile.host, profile.port, e
                )));
            }
        };

        let guard = JumpGuard {
            handle,
            host: jump.host.clone(),
            port: jump.port,
        };
        Ok((TunnelStream::Channel(channel.into_stream()), Some(guard)))
    }
}

/// 直连目标主机
async fn direct_connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| SshError::Timeout(connect_timeout.as_secs()))?
        .map_err(SshError::Io)
}
