// ShellMaster SSH 连接引擎
//
// 模块结构:
// - config: 连接档案 (ConnectionProfile, AuthType, ProxyKind)
// - error: 错误类型与分类 (SshError, ErrorKind, ErrorInfo)
// - event: 连接事件 (ConnectionEvent, ConnectionStage, SessionEvent)
// - known_hosts: TOFU 信任库 (TrustStore, TrustedHostKey)
// - decision: 主机密钥决议协议 (HostKeyResolver, ChannelResolver)
// - stores: 外部协作方契约 (CredentialStore, IdentityStore, KnockSequence)
// - auth: 认证器 (Authenticator, ResolvedAuth)
// - handler: russh Handler 实现
// - proxy: HTTP/SOCKS 代理连接
// - tunnel: 隧道提供器 (直连 / 代理 / SSH 跳板机)
// - session: SSH 会话 (SshSession, TerminalChannel)
// - controller: 连接状态机 (ConnectionController)
// - manager: 会话池 (SessionManager)

pub mod auth;
pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod event;
pub mod handler;
pub mod known_hosts;
pub mod logging;
pub mod manager;
pub mod proxy;
pub mod session;
pub mod stores;
pub mod tunnel;

// 公开导出
pub use auth::{Authenticator, ResolvedAuth};
pub use config::{
    AlgorithmPreferences, AuthType, ConnectionProfile, JumpHostConfig, KeepaliveConfig,
    ProxyKind, ReconnectPolicy,
};
pub use controller::{ConnectionController, ControllerDeps};
pub use decision::{
    ChannelResolver, HostKeyDecision, HostKeyPrompt, HostKeyRequest, HostKeyResolver,
    DECISION_TIMEOUT,
};
pub use error::{ErrorInfo, ErrorKind, SshError};
pub use event::{
    ConnectionEvent, ConnectionStage, ConnectionState, LogEntry, LogLevel, SessionEvent,
    SessionEventKind,
};
pub use known_hosts::{
    JsonFileTrust, TrustLevel, TrustPersistence, TrustStore, TrustedHostKey, VerificationOutcome,
};
pub use manager::{PoolStats, SessionManager};
pub use session::{CommandOutput, PtyRequest, SshSession, TerminalChannel};
pub use stores::{CredentialStore, Identity, IdentityStore, KnockSequence};
pub use tunnel::{TunnelProvisioner, TunnelStream};
