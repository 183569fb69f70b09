// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait
//
// check_server_key 是 TOFU 验证与决议协议的汇合点：
// 信任库给出验证结果，NewHost / Changed 在这里阻塞等待
// 外部决定，拒绝通过共享标志位暴露给控制器做错误归类。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use tokio::sync::mpsc;
use tracing::warn;

use crate::decision::{resolve_with_timeout, HostKeyDecision, HostKeyPrompt, HostKeyResolver};
use crate::event::{ConnectionEvent, LogEntry};
use crate::known_hosts::{
    fingerprint, TrustLevel, TrustStore, TrustedHostKey, VerificationOutcome,
};

/// SSH 客户端 Handler
/// 处理 SSH 连接过程中的各种回调
pub struct ClientHandler {
    /// 共享信任库
    trust: Arc<TrustStore>,
    /// 主机密钥决策方（缺席时 NewHost / Changed 一律拒绝）
    resolver: Option<Arc<dyn HostKeyResolver>>,
    /// 决议等待上限
    decision_wait: Duration,
    /// 目标主机
    host: String,
    /// 目标端口
    port: u16,
    /// 事件发送器（用于通知 UI）
    event_sender: mpsc::UnboundedSender<ConnectionEvent>,
    /// 密钥被拒绝的标志，控制器据此把握手失败归类为 HostKeyRejected
    rejected: Arc<AtomicBool>,
    /// 决议窗口锁：验证期间持有，取消路径须等它释放
    decision_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ClientHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trust: Arc<TrustStore>,
        resolver: Option<Arc<dyn HostKeyResolver>>,
        decision_wait: Duration,
        host: String,
        port: u16,
        event_sender: mpsc::UnboundedSender<ConnectionEvent>,
        rejected: Arc<AtomicBool>,
        decision_gate: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            trust,
            resolver,
            decision_wait,
            host,
            port,
            event_sender,
            rejected,
            decision_gate,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let trust = self.trust.clone();
        let resolver = self.resolver.clone();
        let decision_wait = self.decision_wait;
        let host = self.host.clone();
        let port = self.port;
        let event_sender = self.event_sender.clone();
        let rejected = self.rejected.clone();
        let decision_gate = self.decision_gate.clone();

        let key_bytes = server_public_key.to_bytes();
        let key_type = server_public_key.algorithm().to_string();

        async move {
            let key_bytes = key_bytes.map_err(|_| russh::Error::CouldNotReadKey)?;
            // 验证与决议期间持锁：进行中的决议等待不会被取消打断
            let _window = decision_gate.lock().await;
            let accepted = verify_server_key(
                &trust,
                resolver.as_ref(),
                decision_wait,
                &host,
                port,
                &key_type,
                &key_bytes,
                &event_sender,
            )
            .await;
            if !accepted {
                rejected.store(true, Ordering::SeqCst);
            }
            Ok(accepted)
        }
    }
}

/// 验证服务器密钥并在需要时征询决定
///
/// 返回 true 表示继续握手。任何非 Accepted 路径都必须拿到
/// 显式的接受决定，否则拒绝。
#[allow(clippy::too_many_arguments)]
pub(crate) async fn verify_server_key(
    trust: &Arc<TrustStore>,
    resolver: Option<&Arc<dyn HostKeyResolver>>,
    decision_wait: Duration,
    host: &str,
    port: u16,
    key_type: &str,
    key_bytes: &[u8],
    event_sender: &mpsc::UnboundedSender<ConnectionEvent>,
) -> bool {
    let presented = fingerprint(key_bytes);
    let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
        "Server key fingerprint: {}",
        presented
    ))));
    let _ = event_sender.send(ConnectionEvent::Log(LogEntry::debug(format!(
        "Server key type: {}",
        key_type
    ))));

    match trust.verify(host, port, key_bytes, &presented).await {
        VerificationOutcome::Accepted => true,
        VerificationOutcome::Invalid => {
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::error(format!(
                "Rejected malformed host key from {}:{}",
                host, port
            ))));
            false
        }
        VerificationOutcome::NewHost => {
            let prompt = HostKeyPrompt {
                host: host.to_string(),
                port,
                key_type: key_type.to_string(),
                fingerprint: presented,
                stored_fingerprint: None,
            };
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::warn(format!(
                "Unknown host {}:{}, waiting for confirmation",
                host, port
            ))));
            let decision = resolve_with_timeout(resolver, &prompt, false, decision_wait).await;
            settle(
                trust,
                host,
                port,
                key_bytes,
                TrustLevel::Tofu,
                decision,
                event_sender,
            )
            .await
        }
        VerificationOutcome::Changed { stored_fingerprint } => {
            let prompt = HostKeyPrompt {
                host: host.to_string(),
                port,
                key_type: key_type.to_string(),
                fingerprint: presented,
                stored_fingerprint: Some(stored_fingerprint),
            };
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::error(format!(
                "HOST KEY CHANGED for {}:{}, waiting for confirmation",
                host, port
            ))));
            let decision = resolve_with_timeout(resolver, &prompt, true, decision_wait).await;
            settle(
                trust,
                host,
                port,
                key_bytes,
                TrustLevel::UserConfirmed,
                decision,
                event_sender,
            )
            .await
        }
    }
}

/// 落实决定：AcceptAndStore 写入信任库，AcceptOnce 只放行本次
async fn settle(
    trust: &Arc<TrustStore>,
    host: &str,
    port: u16,
    key_bytes: &[u8],
    level: TrustLevel,
    decision: HostKeyDecision,
    event_sender: &mpsc::UnboundedSender<ConnectionEvent>,
) -> bool {
    match decision {
        HostKeyDecision::AcceptAndStore => {
            let entry = TrustedHostKey::from_key_bytes(host, port, key_bytes, level);
            if let Err(e) = trust.remember(entry).await {
                // 持久化失败不阻断本次连接，下次仍会重新确认
                warn!("Failed to store host key for {}:{}: {}", host, port, e);
            }
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
                "Host key for {}:{} accepted and stored",
                host, port
            ))));
            true
        }
        HostKeyDecision::AcceptOnce => {
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::info(format!(
                "Host key for {}:{} accepted for this session only",
                host, port
            ))));
            true
        }
        HostKeyDecision::Reject => {
            let _ = event_sender.send(ConnectionEvent::Log(LogEntry::error(format!(
                "Host key for {}:{} rejected",
                host, port
            ))));
            false
        }
    }
}
