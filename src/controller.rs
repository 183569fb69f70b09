// 连接控制器
//
// 每个终端标签页一个控制器，独占持有自己的状态机：
// Disconnected -> Connecting -> Authenticating -> Connected
// 任何阶段失败进入 Error；仅瞬态错误在策略范围内自动重连，
// 凡呈现认证失败特征的错误永不重试。connect 只能从
// Disconnected / Error 发起，disconnect 幂等并可取消进行中的连接。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{self, Authenticator};
use crate::config::ConnectionProfile;
use crate::decision::{HostKeyResolver, DECISION_TIMEOUT};
use crate::error::{is_auth_failure_message, ErrorInfo, SshError};
use crate::event::{ConnectionEvent, ConnectionStage, ConnectionState, LogEntry};
use crate::handler::ClientHandler;
use crate::known_hosts::TrustStore;
use crate::session::{CommandOutput, PtyRequest, SshSession, TerminalChannel};
use crate::stores::KnockSequence;
use crate::tunnel::TunnelProvisioner;

/// 控制器依赖集
///
/// 信任库与凭据相关组件由所有控制器共享，
/// 决策方与敲门钩子按需注入。
pub struct ControllerDeps {
    pub trust: Arc<TrustStore>,
    pub authenticator: Arc<Authenticator>,
    pub resolver: Option<Arc<dyn HostKeyResolver>>,
    pub knock: Option<Arc<dyn KnockSequence>>,
    pub decision_wait: Duration,
}

impl ControllerDeps {
    pub fn new(trust: Arc<TrustStore>, authenticator: Arc<Authenticator>) -> Self {
        Self {
            trust,
            authenticator,
            resolver: None,
            knock: None,
            decision_wait: DECISION_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostKeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_knock(mut self, knock: Arc<dyn KnockSequence>) -> Self {
        self.knock = Some(knock);
        self
    }

    pub fn with_decision_wait(mut self, wait: Duration) -> Self {
        self.decision_wait = wait;
        self
    }
}

/// 连接控制器
pub struct ConnectionController {
    profile: ConnectionProfile,
    deps: ControllerDeps,
    provisioner: TunnelProvisioner,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    session: Mutex<Option<Arc<SshSession>>>,
    /// 进行中连接的取消令牌，每次 connect 换新
    cancel: std::sync::Mutex<CancellationToken>,
    /// 串行化 connect 调用
    connect_lock: Mutex<()>,
}

impl ConnectionController {
    /// 创建控制器，返回事件接收端
    pub fn new(
        profile: ConnectionProfile,
        deps: ControllerDeps,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let provisioner = TunnelProvisioner::new(
            deps.trust.clone(),
            deps.authenticator.clone(),
            deps.resolver.clone(),
            deps.decision_wait,
        );
        (
            Self {
                profile,
                deps,
                provisioner,
                state_tx,
                event_tx,
                session: Mutex::new(None),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                connect_lock: Mutex::new(()),
            },
            event_rx,
        )
    }

    /// 档案
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// 当前状态
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 当前会话（Connected 时存在）
    pub async fn session(&self) -> Option<Arc<SshSession>> {
        self.session.lock().await.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.event_tx.send(ConnectionEvent::StateChanged(state));
    }

    fn set_stage(&self, stage: ConnectionStage) {
        let _ = self.event_tx.send(ConnectionEvent::StageChanged(stage));
    }

    fn log(&self, entry: LogEntry) {
        let _ = self.event_tx.send(ConnectionEvent::Log(entry));
    }

    /// 发起连接
    ///
    /// 仅允许从 Disconnected / Error 发起；成功返回会话，
    /// 失败返回分类后的错误信息（此前已作为 Failed 事件广播）。
    pub async fn connect(&self) -> Result<Arc<SshSession>, ErrorInfo> {
        let _guard = self.connect_lock.lock().await;

        let current = self.state();
        if !matches!(
            current,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            let err = SshError::IllegalState(format!(
                "connect is not allowed while {}",
                current.label()
            ));
            return Err(ErrorInfo::classify(&err, &self.profile, false));
        }

        let cancel = {
            let mut guard = self.cancel.lock().unwrap();
            *guard = CancellationToken::new();
            guard.clone()
        };

        let policy = self.profile.reconnect.clone();
        let mut attempt = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);
            self.set_stage(ConnectionStage::Initializing);
            self.log(LogEntry::info(format!(
                "Connecting to {}@{}:{}",
                self.profile.username, self.profile.host, self.profile.port
            )));

            let rejected = Arc::new(AtomicBool::new(false));
            let decision_gate = Arc::new(tokio::sync::Mutex::new(()));
            let result = tokio::select! {
                _ = cancelled_after_decision(&cancel, &decision_gate) => Err(SshError::Cancelled),
                r = self.attempt(&rejected, &decision_gate) => r,
            };

            match result {
                Ok(session) => {
                    let session = Arc::new(session);
                    *self.session.lock().await = Some(session.clone());
                    self.set_state(ConnectionState::Connected);
                    self.set_stage(ConnectionStage::Connected);
                    info!(
                        "Connected to {}:{} (session {})",
                        self.profile.host,
                        self.profile.port,
                        session.id()
                    );
                    let _ = self.event_tx.send(ConnectionEvent::Connected {
                        session_id: session.id().to_string(),
                    });
                    return Ok(session);
                }
                Err(SshError::Cancelled) => {
                    self.set_state(ConnectionState::Disconnected);
                    let _ = self.event_tx.send(ConnectionEvent::Disconnected {
                        reason: "Connection cancelled".to_string(),
                    });
                    return Err(ErrorInfo::classify(
                        &SshError::Cancelled,
                        &self.profile,
                        false,
                    ));
                }
                Err(err) => {
                    let info =
                        ErrorInfo::classify(&err, &self.profile, rejected.load(Ordering::SeqCst));
                    let retryable = info.kind.is_transient()
                        && !is_auth_failure_message(&err.to_string())
                        && attempt < policy.max_attempts;

                    warn!(
                        "Connection to {}:{} failed ({}): {}",
                        self.profile.host,
                        self.profile.port,
                        info.kind.label(),
                        err
                    );

                    if !retryable {
                        self.set_state(ConnectionState::Error);
                        let _ = self
                            .event_tx
                            .send(ConnectionEvent::Failed { error: info.clone() });
                        return Err(info);
                    }

                    attempt += 1;
                    self.log(LogEntry::warn(format!(
                        "Retrying in {}s (attempt {}/{})",
                        policy.backoff_secs, attempt, policy.max_attempts
                    )));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(ConnectionState::Disconnected);
                            let _ = self.event_tx.send(ConnectionEvent::Disconnected {
                                reason: "Connection cancelled".to_string(),
                            });
                            return Err(ErrorInfo::classify(
                                &SshError::Cancelled,
                                &self.profile,
                                false,
                            ));
                        }
                        _ = tokio::time::sleep(Duration::from_secs(policy.backoff_secs)) => {}
                    }
                }
            }
        }
    }

    /// 单次连接尝试
    async fn attempt(
        &self,
        rejected: &Arc<AtomicBool>,
        decision_gate: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<SshSession, SshError> {
        // 敲门钩子：失败只记录，不阻断连接
        if let Some(knock) = &self.deps.knock {
            if !knock.run_knock_sequence(&self.profile.host).await {
                self.log(LogEntry::warn(format!(
                    "Knock sequence for {} failed, continuing",
                    self.profile.host
                )));
            }
        }

        // 凭据先行：缺失凭据时不打开任何网络连接
        let resolved = self.deps.authenticator.resolve(&self.profile).await?;

        if !self.profile.preferences.is_empty() {
            self.log(LogEntry::debug(format!(
                "Algorithm preferences: ciphers={:?} macs={:?} kex={:?}",
                self.profile.preferences.ciphers,
                self.profile.preferences.macs,
                self.profile.preferences.kex
            )));
        }

        if self.profile.proxy.is_none() {
            self.set_stage(ConnectionStage::ConnectingHost);
        }
        let (stream, jump) = self
            .provisioner
            .provision(&self.profile, &self.event_tx, rejected, decision_gate)
            .await?;

        self.set_stage(ConnectionStage::Handshaking);
        self.log(LogEntry::debug("Starting SSH handshake"));
        let handler = ClientHandler::new(
            self.deps.trust.clone(),
            self.deps.resolver.clone(),
            self.deps.decision_wait,
            self.profile.host.clone(),
            self.profile.port,
            self.event_tx.clone(),
            rejected.clone(),
            decision_gate.clone(),
        );
        let config = Arc::new(self.profile.to_russh_config());
        let mut handle = timeout(
            self.profile.connect_timeout(),
            russh::client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(self.profile.connect_timeout))?
        .map_err(SshError::from)?;

        self.set_state(ConnectionState::Authenticating);
        self.set_stage(ConnectionStage::Authenticating);
        self.log(LogEntry::info(format!(
            "Authenticating as {} ({})",
            self.profile.username,
            resolved.label()
        )));
        auth::apply(&mut handle, &self.profile.username, &resolved).await?;

        self.set_stage(ConnectionStage::EstablishingChannel);
        Ok(SshSession::new(
            handle,
            self.profile.host.clone(),
            self.profile.username.clone(),
            jump,
        ))
    }

    async fn require_session(&self) -> Result<Arc<SshSession>, SshError> {
        if self.state() != ConnectionState::Connected {
            return Err(SshError::IllegalState(format!(
                "channel operations require Connected, current state is {}",
                self.state().label()
            )));
        }
        self.session().await.ok_or_else(|| {
            SshError::IllegalState("no session bound to this controller".to_string())
        })
    }

    /// 打开交互式终端（需要 Connected）
    pub async fn open_shell(&self, pty: PtyRequest) -> Result<TerminalChannel, SshError> {
        let session = self.require_session().await?;
        session.open_terminal(pty).await
    }

    /// 执行单个命令（需要 Connected）
    ///
    /// 非零退出码只记录，不视为错误。
    pub async fn execute(
        &self,
        command: &str,
        wait: Duration,
    ) -> Result<CommandOutput, SshError> {
        let session = self.require_session().await?;
        let output = timeout(wait, session.execute(command))
            .await
            .map_err(|_| SshError::Timeout(wait.as_secs()))??;
        if !output.is_success() {
            warn!(
                "Command exited with {}: {}",
                output.exit_code,
                output.stderr_string().trim()
            );
        }
        Ok(output)
    }

    /// 打开文件传输会话（需要 Connected）
    pub async fn open_file_transfer(&self) -> Result<russh_sftp::client::SftpSession, SshError> {
        let session = self.require_session().await?;
        session.open_sftp().await
    }

    /// 断开连接（幂等）
    ///
    /// 取消进行中的连接尝试，关闭已建立的会话。
    pub async fn disconnect(&self) {
        self.cancel.lock().unwrap().cancel();

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let _ = session.close().await;
        }

        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            let _ = self.event_tx.send(ConnectionEvent::Disconnected {
                reason: "Disconnected by user".to_string(),
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// 等待取消生效
///
/// 取消不打断进行中的主机密钥决议：Handler 在决议窗口内持有
/// decision_gate，这里在令牌触发后再等窗口释放（显式决定或超时），
/// 之后才允许 select 丢弃连接尝试。
async fn cancelled_after_decision(
    cancel: &CancellationToken,
    decision_gate: &Arc<tokio::sync::Mutex<()>>,
) {
    cancel.cancelled().await;
    let _ = decision_gate.lock().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::error::ErrorKind;
    use crate::known_hosts::JsonFileTrust;
    use crate::stores::{CredentialStore, Identity, IdentityStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct MapCredentials(HashMap<String, String>);

    #[async_trait]
    impl CredentialStore for MapCredentials {
        async fn get_password(&self, profile_id: &str) -> Option<String> {
            self.0.get(profile_id).cloned()
        }
        async fn get_private_key(&self, _: &str) -> Option<String> {
            None
        }
    }

    struct NoIdentities;

    #[async_trait]
    impl IdentityStore for NoIdentities {
        async fn find_identity_by_username(&self, _: &str) -> Option<Identity> {
            None
        }
    }

    struct CountingKnock(AtomicUsize);

    #[async_trait]
    impl KnockSequence for CountingKnock {
        async fn run_knock_sequence(&self, _: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn deps(dir: &tempfile::TempDir, passwords: &[(&str, &str)]) -> ControllerDeps {
        let trust = Arc::new(TrustStore::new(Arc::new(JsonFileTrust::with_path(
            dir.path().join("known_hosts.json"),
        ))));
        let authenticator = Arc::new(Authenticator::new(
            Arc::new(MapCredentials(
                passwords
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
            Arc::new(NoIdentities),
        ));
        ControllerDeps::new(trust, authenticator)
    }

    fn refused_profile() -> ConnectionProfile {
        ConnectionProfile {
            id: "p1".to_string(),
            host: "127.0.0.1".to_string(),
            // 端口 1 上没有 SSH 服务
            port: 1,
            username: "root".to_string(),
            reconnect: ReconnectPolicy {
                max_attempts: 0,
                backoff_secs: 0,
            },
            ..Default::default()
        }
    }

    fn count_connecting(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                ConnectionEvent::StateChanged(ConnectionState::Connecting)
            ) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn refused_connection_retries_then_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = refused_profile();
        profile.reconnect.max_attempts = 2;
        let (controller, mut events) =
            ConnectionController::new(profile, deps(&dir, &[("p1", "pw")]));

        let err = controller.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionRefused);
        assert_eq!(controller.state(), ConnectionState::Error);
        // 初次尝试 + 两次重试
        assert_eq!(count_connecting(&mut events), 3);
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = refused_profile();
        profile.reconnect.max_attempts = 3;
        let (controller, mut events) = ConnectionController::new(profile, deps(&dir, &[]));

        let err = controller.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
        // 认证类失败永不重试
        assert_eq!(count_connecting(&mut events), 1);
        assert_eq!(controller.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _events) =
            ConnectionController::new(refused_profile(), deps(&dir, &[("p1", "pw")]));
        controller.force_state(ConnectionState::Connected);

        let err = controller.connect().await.unwrap_err();
        assert!(err.message.contains("Illegal state"));
        // 状态不被破坏
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_from_error_state_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _events) =
            ConnectionController::new(refused_profile(), deps(&dir, &[("p1", "pw")]));

        let _ = controller.connect().await.unwrap_err();
        assert_eq!(controller.state(), ConnectionState::Error);
        // Error 状态允许重新发起
        let err = controller.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _events) =
            ConnectionController::new(refused_profile(), deps(&dir, &[("p1", "pw")]));

        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_inflight_connect() {
        // 监听但不发送 SSH 版本行，让握手悬挂
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let mut profile = refused_profile();
        profile.port = addr.port();
        let (controller, _events) =
            ConnectionController::new(profile, deps(&dir, &[("p1", "pw")]));
        let controller = Arc::new(controller);

        let connecting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.disconnect().await;

        let result = connecting.await.unwrap();
        assert!(result.is_err());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn knock_hook_failure_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let knock = Arc::new(CountingKnock(AtomicUsize::new(0)));
        let deps = deps(&dir, &[("p1", "pw")]).with_knock(knock.clone());
        let (controller, _events) = ConnectionController::new(refused_profile(), deps);

        let err = controller.connect().await.unwrap_err();
        // 敲门失败后连接继续，最终因端口拒绝而失败
        assert_eq!(err.kind, ErrorKind::ConnectionRefused);
        assert_eq!(knock.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_ops_require_connected() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _events) =
            ConnectionController::new(refused_profile(), deps(&dir, &[("p1", "pw")]));

        let err = controller
            .open_shell(crate::session::PtyRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SshError::IllegalState(_)));

        let err = controller
            .execute("uptime", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SshError::IllegalState(_)));

        match controller.open_file_transfer().await {
            Err(crate::error::SshError::IllegalState(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an illegal-state error"),
        }
    }

    #[tokio::test]
    async fn jump_host_failure_is_fatal_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = refused_profile();
        profile.host = "10.0.0.5".to_string();
        profile.port = 22;
        profile.reconnect.max_attempts = 2;
        profile.proxy = Some(crate::config::ProxyKind::SshJump(
            crate::config::JumpHostConfig {
                // 端口 1 上没有 SSH 服务
                host: "127.0.0.1".to_string(),
                port: 1,
                username: "jump".to_string(),
                auth: None,
            },
        ));
        let (controller, mut events) =
            ConnectionController::new(profile, deps(&dir, &[("p1", "pw")]));

        let err = controller.connect().await.unwrap_err();
        // 跳板机故障是终态，不随策略重试
        assert_eq!(err.kind, ErrorKind::JumpHostFailure);
        assert_eq!(count_connecting(&mut events), 1);
        assert_eq!(controller.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn cancellation_waits_for_pending_decision() {
        let cancel = CancellationToken::new();
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        // 模拟进行中的决议窗口
        let window = gate.clone().lock_owned().await;

        let waiter = {
            let cancel = cancel.clone();
            let gate = gate.clone();
            tokio::spawn(async move { cancelled_after_decision(&cancel, &gate).await })
        };

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // 窗口未释放前取消不得生效
        assert!(!waiter.is_finished());

        drop(window);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn state_watch_observes_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _events) =
            ConnectionController::new(refused_profile(), deps(&dir, &[("p1", "pw")]));
        let watch = controller.watch_state();
        assert_eq!(*watch.borrow(), ConnectionState::Disconnected);

        let _ = controller.connect().await.unwrap_err();
        assert_eq!(*watch.borrow(), ConnectionState::Error);
    }
}
