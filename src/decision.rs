// 主机密钥决议协议
//
// NewHost / Changed 结果必须暂停连接，向外部决策方（UI 层）
// 同步征询决定。连接工作线程在有界等待上阻塞；超时或决策方
// 缺席一律视为 Reject（fail closed）。任何路径都不允许绕过
// 决议接受未知或已变化的密钥。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// 默认决议等待上限
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(60);

/// 决议结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// 接受并写入信任库
    AcceptAndStore,
    /// 仅本次接受，不持久化
    AcceptOnce,
    /// 拒绝，连接以 HostKeyRejected 终止
    Reject,
}

/// 征询决定时展示给决策方的信息
#[derive(Clone, Debug)]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint: String,
    /// Changed 时携带原先存储的指纹
    pub stored_fingerprint: Option<String>,
}

/// 决策方接口
///
/// 每个控制器经构造注入自己的 resolver，不存在进程级回调。
#[async_trait]
pub trait HostKeyResolver: Send + Sync {
    /// 首次见到的主机
    async fn resolve_new_host(&self, prompt: &HostKeyPrompt) -> HostKeyDecision;
    /// 密钥已变化的主机
    async fn resolve_changed_key(&self, prompt: &HostKeyPrompt) -> HostKeyDecision;
}

/// 带超时地征询决定
///
/// resolver 缺席或超时 -> Reject。
pub async fn resolve_with_timeout(
    resolver: Option<&Arc<dyn HostKeyResolver>>,
    prompt: &HostKeyPrompt,
    changed: bool,
    wait: Duration,
) -> HostKeyDecision {
    let Some(resolver) = resolver else {
        warn!(
            "No host key resolver for {}:{}, rejecting",
            prompt.host, prompt.port
        );
        return HostKeyDecision::Reject;
    };

    let fut = async {
        if changed {
            resolver.resolve_changed_key(prompt).await
        } else {
            resolver.resolve_new_host(prompt).await
        }
    };

    match tokio::time::timeout(wait, fut).await {
        Ok(decision) => decision,
        Err(_) => {
            warn!(
                "Host key decision for {}:{} timed out after {:?}, rejecting",
                prompt.host, prompt.port, wait
            );
            HostKeyDecision::Reject
        }
    }
}

/// 发给决策方的请求：提示信息 + 一次性应答器
pub struct HostKeyRequest {
    pub prompt: HostKeyPrompt,
    /// true 表示密钥变化警告，false 表示未知主机确认
    pub changed: bool,
    /// 决策方恰好调用一次；drop 即视为 Reject
    pub respond: oneshot::Sender<HostKeyDecision>,
}

/// 基于通道的 resolver
///
/// 工作线程把请求投递到无界通道并阻塞在一次性应答上，
/// UI 侧（任意线程）收到请求后通过 `respond` 发送决定。
pub struct ChannelResolver {
    tx: mpsc::UnboundedSender<HostKeyRequest>,
}

impl ChannelResolver {
    /// 创建 resolver 与请求接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostKeyRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    async fn ask(&self, prompt: &HostKeyPrompt, changed: bool) -> HostKeyDecision {
        let (respond, answer) = oneshot::channel();
        let request = HostKeyRequest {
            prompt: prompt.clone(),
            changed,
            respond,
        };
        if self.tx.send(request).is_err() {
            // 接收端已关闭：没有可用的决策方
            return HostKeyDecision::Reject;
        }
        // 应答器被 drop 也落到 Reject
        answer.await.unwrap_or(HostKeyDecision::Reject)
    }
}

#[async_trait]
impl HostKeyResolver for ChannelResolver {
    async fn resolve_new_host(&self, prompt: &HostKeyPrompt) -> HostKeyDecision {
        self.ask(prompt, false).await
    }

    async fn resolve_changed_key(&self, prompt: &HostKeyPrompt) -> HostKeyDecision {
        self.ask(prompt, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> HostKeyPrompt {
        HostKeyPrompt {
            host: "10.0.0.5".to_string(),
            port: 22,
            key_type: "ssh-ed25519".to_string(),
            fingerprint: "SHA256:aa:bb".to_string(),
            stored_fingerprint: None,
        }
    }

    /// 永远不回答的决策方
    struct Silent;

    #[async_trait]
    impl HostKeyResolver for Silent {
        async fn resolve_new_host(&self, _: &HostKeyPrompt) -> HostKeyDecision {
            std::future::pending().await
        }
        async fn resolve_changed_key(&self, _: &HostKeyPrompt) -> HostKeyDecision {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn missing_resolver_rejects() {
        let decision = resolve_with_timeout(None, &prompt(), false, DECISION_TIMEOUT).await;
        assert_eq!(decision, HostKeyDecision::Reject);
    }

    #[tokio::test]
    async fn timeout_rejects() {
        let resolver: Arc<dyn HostKeyResolver> = Arc::new(Silent);
        let decision = resolve_with_timeout(
            Some(&resolver),
            &prompt(),
            true,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(decision, HostKeyDecision::Reject);
    }

    #[tokio::test]
    async fn channel_resolver_roundtrip() {
        let (resolver, mut rx) = ChannelResolver::new();
        let resolver: Arc<dyn HostKeyResolver> = Arc::new(resolver);

        let ui = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert!(!request.changed);
            assert_eq!(request.prompt.host, "10.0.0.5");
            request.respond.send(HostKeyDecision::AcceptOnce).unwrap();
        });

        let decision =
            resolve_with_timeout(Some(&resolver), &prompt(), false, DECISION_TIMEOUT).await;
        assert_eq!(decision, HostKeyDecision::AcceptOnce);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_responder_rejects() {
        let (resolver, mut rx) = ChannelResolver::new();
        let resolver: Arc<dyn HostKeyResolver> = Arc::new(resolver);

        let ui = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            drop(request.respond);
        });

        let decision =
            resolve_with_timeout(Some(&resolver), &prompt(), true, DECISION_TIMEOUT).await;
        assert_eq!(decision, HostKeyDecision::Reject);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn closed_channel_rejects() {
        let (resolver, rx) = ChannelResolver::new();
        drop(rx);
        let resolver: Arc<dyn HostKeyResolver> = Arc::new(resolver);
        let decision =
            resolve_with_timeout(Some(&resolver), &prompt(), false, DECISION_TIMEOUT).await;
        assert_eq!(decision, HostKeyDecision::Reject);
    }
}
