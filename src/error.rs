// SSH 错误类型与分类
//
// SshError 是传输路径上的原始错误；ErrorInfo 是分类后交给
// 监听方的产物，每次失败只生成一次，附带用户提示与修复建议。

use thiserror::Error;

use crate::config::ConnectionProfile;

/// SSH 错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 主机名解析失败
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// IO 错误（网络连接等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 凭据库中没有所需凭据
    #[error("No credential available: {0}")]
    NoCredential(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 代理错误
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// 跳板机错误
    #[error("Jump host error: {0}")]
    JumpHost(String),

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    /// 通道错误
    #[error("Channel error: {0}")]
    Channel(String),

    /// 会话已断开
    #[error("Session disconnected: {0}")]
    Disconnected(String),

    /// known hosts 存储错误
    #[error("Known hosts storage error: {0}")]
    Storage(String),

    /// 当前状态不允许该操作
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// 连接已取消
    #[error("Connection cancelled")]
    Cancelled,
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}

/// 错误种类
///
/// 瞬态错误（网络类）允许有限次自动重连；
/// 终态错误（认证、主机密钥、跳板机、算法协商）永不自动重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    UnknownHost,
    ConnectionRefused,
    NetworkError,
    AuthenticationFailed,
    AlgorithmMismatch,
    HostKeyRejected,
    JumpHostFailure,
    GenericSshError,
    Unknown,
}

impl ErrorKind {
    /// 是否为可自动重试的瞬态错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::UnknownHost | Self::ConnectionRefused | Self::NetworkError
        )
    }

    /// 用户可读的种类名
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "Connection timeout",
            Self::UnknownHost => "Unknown host",
            Self::ConnectionRefused => "Connection refused",
            Self::NetworkError => "Network error",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlgorithmMismatch => "Algorithm negotiation failed",
            Self::HostKeyRejected => "Host key rejected",
            Self::JumpHostFailure => "Jump host failure",
            Self::GenericSshError => "SSH error",
            Self::Unknown => "Unknown error",
        }
    }

    /// 修复建议
    pub fn remedies(&self) -> &'static [&'static str] {
        match self {
            Self::Timeout => &[
                "Check that the host is reachable from this network",
                "Increase the connection timeout in the profile",
                "Verify firewall rules between you and the server",
            ],
            Self::UnknownHost => &[
                "Check the hostname for typos",
                "Verify DNS resolution (try `ping` or `nslookup`)",
            ],
            Self::ConnectionRefused => &[
                "Verify the SSH service is running on the server",
                "Check that the port number is correct",
                "Check firewall rules on the server",
            ],
            Self::NetworkError => &[
                "Check your network connection",
                "If a proxy is configured, verify it is reachable",
            ],
            Self::AuthenticationFailed => &[
                "Verify the username and credentials",
                "For key auth, confirm the key is authorized on the server",
                "Check the server's auth policy (PasswordAuthentication, etc.)",
            ],
            Self::AlgorithmMismatch => &[
                "The server offers no algorithms in common with this client",
                "Update the server's SSH daemon or adjust its algorithm lists",
            ],
            Self::HostKeyRejected => &[
                "The host key was not accepted",
                "If the server was legitimately reinstalled, remove the stored key and reconnect",
                "If the change is unexpected, do NOT connect - possible MITM attack",
            ],
            Self::JumpHostFailure => &[
                "Verify the jump host is reachable and its credentials are valid",
                "Check that the jump host allows TCP forwarding (AllowTcpForwarding)",
            ],
            Self::GenericSshError => &["Inspect the diagnostic detail below"],
            Self::Unknown => &["Inspect the diagnostic detail below"],
        }
    }
}

/// 认证失败的消息签名（大小写不敏感匹配）
const AUTH_FAILURE_SIGNATURES: [&str; 6] = [
    "auth fail",
    "authentication",
    "permission denied",
    "too many authentication failures",
    "publickey",
    "password",
];

/// 错误消息是否呈现认证失败特征
///
/// 命中即永不自动重连，与分类出的种类无关。
pub fn is_auth_failure_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_FAILURE_SIGNATURES.iter().any(|s| lower.contains(s))
}

/// 分类后的错误信息，随事件广播给监听方
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    /// 错误种类
    pub kind: ErrorKind,
    /// 用户可读消息
    pub message: String,
    /// 诊断详情（目标、认证方式、超时、代理配置），支持"复制诊断信息"
    pub detail: String,
    /// 修复建议
    pub remedies: Vec<String>,
    /// 底层原因
    pub source: Option<String>,
}

impl ErrorInfo {
    /// 对一次连接失败做分类
    ///
    /// `host_key_rejected` 由 Handler 在验证被拒后置位：russh 把拒绝
    /// 统一上抛为协议错误，需要这个标记才能还原真实种类。
    pub fn classify(err: &SshError, profile: &ConnectionProfile, host_key_rejected: bool) -> Self {
        let kind = if host_key_rejected {
            ErrorKind::HostKeyRejected
        } else {
            Self::kind_of(err)
        };

        Self {
            kind,
            message: format!("{}: {}", kind.label(), err),
            detail: Self::diagnostics(profile),
            remedies: kind.remedies().iter().map(|s| s.to_string()).collect(),
            source: Some(err.to_string()),
        }
    }

    fn kind_of(err: &SshError) -> ErrorKind {
        match err {
            SshError::Timeout(_) => ErrorKind::Timeout,
            SshError::UnknownHost(_) => ErrorKind::UnknownHost,
            SshError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::NetworkError,
            },
            SshError::Auth(_) | SshError::NoCredential(_) | SshError::Key(_) => {
                ErrorKind::AuthenticationFailed
            }
            SshError::JumpHost(_) => ErrorKind::JumpHostFailure,
            SshError::Proxy(_) | SshError::Disconnected(_) => ErrorKind::NetworkError,
            SshError::Protocol(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("no common")
                    || lower.contains("kex")
                    || lower.contains("cipher")
                    || lower.contains("algorithm")
                {
                    ErrorKind::AlgorithmMismatch
                } else if is_auth_failure_message(&lower) {
                    ErrorKind::AuthenticationFailed
                } else {
                    ErrorKind::GenericSshError
                }
            }
            SshError::Channel(_) => ErrorKind::GenericSshError,
            _ => ErrorKind::Unknown,
        }
    }

    /// 生成档案的诊断摘要
    fn diagnostics(profile: &ConnectionProfile) -> String {
        let mut lines = vec![
            format!(
                "target: {}@{}:{}",
                profile.username, profile.host, profile.port
            ),
            format!("auth: {}", profile.auth.label()),
            format!("connect timeout: {}s", profile.connect_timeout),
        ];
        match &profile.proxy {
            Some(proxy) => lines.push(format!("proxy: {}", proxy.summary())),
            None => lines.push("proxy: none".to_string()),
        }
        if !profile.preferences.is_empty() {
            lines.push(format!(
                "preferences: ciphers={:?} macs={:?} kex={:?}",
                profile.preferences.ciphers, profile.preferences.macs, profile.preferences.kex
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            id: "p1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "root".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn auth_failure_signatures() {
        assert!(is_auth_failure_message("Permission Denied (publickey)"));
        assert!(is_auth_failure_message("too many AUTHENTICATION failures"));
        assert!(is_auth_failure_message("server rejected password"));
        assert!(!is_auth_failure_message("connection reset by peer"));
        assert!(!is_auth_failure_message("no route to host"));
    }

    #[test]
    fn transient_vs_terminal() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::ConnectionRefused.is_transient());
        assert!(ErrorKind::NetworkError.is_transient());
        assert!(ErrorKind::UnknownHost.is_transient());
        assert!(!ErrorKind::AuthenticationFailed.is_transient());
        assert!(!ErrorKind::HostKeyRejected.is_transient());
        assert!(!ErrorKind::JumpHostFailure.is_transient());
        assert!(!ErrorKind::AlgorithmMismatch.is_transient());
    }

    #[test]
    fn classify_timeout() {
        let info = ErrorInfo::classify(&SshError::Timeout(30), &profile(), false);
        assert_eq!(info.kind, ErrorKind::Timeout);
        assert!(info.detail.contains("root@10.0.0.5:22"));
        assert!(!info.remedies.is_empty());
    }

    #[test]
    fn classify_refused() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let info = ErrorInfo::classify(&SshError::Io(io), &profile(), false);
        assert_eq!(info.kind, ErrorKind::ConnectionRefused);
    }

    #[test]
    fn classify_auth() {
        let info = ErrorInfo::classify(
            &SshError::Auth("Password authentication failed".to_string()),
            &profile(),
            false,
        );
        assert_eq!(info.kind, ErrorKind::AuthenticationFailed);
        let info = ErrorInfo::classify(&SshError::NoCredential("p1".to_string()), &profile(), false);
        assert_eq!(info.kind, ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn classify_algorithm_mismatch() {
        let info = ErrorInfo::classify(
            &SshError::Protocol("No common kex algorithm".to_string()),
            &profile(),
            false,
        );
        assert_eq!(info.kind, ErrorKind::AlgorithmMismatch);
    }

    #[test]
    fn host_key_rejection_flag_wins() {
        let info = ErrorInfo::classify(
            &SshError::Protocol("Unknown server key".to_string()),
            &profile(),
            true,
        );
        assert_eq!(info.kind, ErrorKind::HostKeyRejected);
        assert!(!info.kind.is_transient());
    }

    #[test]
    fn classify_jump_host() {
        let info = ErrorInfo::classify(
            &SshError::JumpHost("bastion unreachable".to_string()),
            &profile(),
            false,
        );
        assert_eq!(info.kind, ErrorKind::JumpHostFailure);
    }
}
