// SSH 连接配置
//
// ConnectionProfile 是只读值对象：由外部存储读出后交给
// ConnectionController 独占持有，生命周期内不再修改。

use serde::{Deserialize, Serialize};

/// 连接档案：描述一个 SSH 目标及其全部连接选项
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// 档案 ID（会话池的键）
    pub id: String,
    /// 显示名称
    pub label: String,
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth: AuthType,
    /// 终端类型
    #[serde(default = "default_term")]
    pub term: String,
    /// 是否启用压缩
    #[serde(default)]
    pub compression: bool,
    /// 心跳配置
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// 代理 / 跳板机配置
    #[serde(default)]
    pub proxy: Option<ProxyKind>,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 算法偏好（仅记录在诊断信息中，协商由底层传输完成）
    #[serde(default)]
    pub preferences: AlgorithmPreferences,
    /// 重连策略
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            id: String::new(),
            label: String::new(),
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthType::Password,
            term: default_term(),
            compression: false,
            keepalive: KeepaliveConfig::default(),
            proxy: None,
            connect_timeout: default_connect_timeout(),
            preferences: AlgorithmPreferences::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 认证方式
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum AuthType {
    /// 密码认证（密码从凭据库按档案 ID 获取）
    Password,
    /// 公钥认证（私钥材料从凭据库按 key_id 获取）
    PublicKey {
        key_id: String,
        passphrase: Option<String>,
    },
    /// 交互式键盘认证（以密码作为应答）
    KeyboardInteractive,
    /// GSSAPI（不支持，跳过后允许服务器回退到其他方法）
    GssApi,
}

impl AuthType {
    /// 诊断信息用的方式名
    pub fn label(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PublicKey { .. } => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
            Self::GssApi => "gssapi",
        }
    }
}

/// 代理 / 跳板机配置
///
/// 带标签的变体，每个变体只携带自己需要的字段。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyKind {
    /// HTTP CONNECT 代理
    Http {
        host: String,
        port: u16,
        auth: Option<(String, String)>,
    },
    /// SOCKS4 代理（仅支持 user-id 鉴别）
    Socks4 {
        host: String,
        port: u16,
        user_id: Option<String>,
    },
    /// SOCKS5 代理
    Socks5 {
        host: String,
        port: u16,
        auth: Option<(String, String)>,
    },
    /// SSH 跳板机（完整会话 + 本地端口转发）
    SshJump(JumpHostConfig),
}

impl ProxyKind {
    /// 诊断信息用的简述
    pub fn summary(&self) -> String {
        match self {
            Self::Http { host, port, .. } => format!("http://{}:{}", host, port),
            Self::Socks4 { host, port, .. } => format!("socks4://{}:{}", host, port),
            Self::Socks5 { host, port, .. } => format!("socks5://{}:{}", host, port),
            Self::SshJump(jump) => {
                format!("ssh-jump://{}@{}:{}", jump.username, jump.host, jump.port)
            }
        }
    }
}

/// 跳板机配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JumpHostConfig {
    /// 跳板机主机
    pub host: String,
    /// 跳板机端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式；为 None 时与主目标共享密码
    pub auth: Option<AuthType>,
}

/// 心跳配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            max_retries: 3,
        }
    }
}

/// 算法偏好列表（cipher / MAC / kex）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AlgorithmPreferences {
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub macs: Vec<String>,
    #[serde(default)]
    pub kex: Vec<String>,
}

impl AlgorithmPreferences {
    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty() && self.macs.is_empty() && self.kex.is_empty()
    }
}

/// 重连策略
///
/// 只有瞬态网络错误才会触发自动重连；认证类失败永不重试。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// 最大重连次数
    pub max_attempts: u32,
    /// 重连间隔（秒）
    pub backoff_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 5,
        }
    }
}

/// russh 客户端配置构建
impl ConnectionProfile {
    /// 构建 russh 配置
    ///
    /// strict host key checking 始终相当于 "ask"：
    /// 服务器公钥一律进入 Handler 的验证回调，由决议协议裁决。
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // russh 没有单独的 connection_timeout，用 inactivity_timeout 兜底
        config.inactivity_timeout = Some(std::time::Duration::from_secs(self.connect_timeout));
        if self.keepalive.enabled {
            config.keepalive_interval =
                Some(std::time::Duration::from_secs(self.keepalive.interval));
            config.keepalive_max = self.keepalive.max_retries as usize;
        }
        if self.compression {
            config.preferred = russh::Preferred::COMPRESSED;
        }
        config
    }

    /// 连接超时
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_defaults() {
        let profile = ConnectionProfile::default();
        assert_eq!(profile.port, 22);
        assert_eq!(profile.term, "xterm-256color");
        assert_eq!(profile.connect_timeout, 30);
        assert_eq!(profile.reconnect.max_attempts, 3);
        assert_eq!(profile.reconnect.backoff_secs, 5);
    }

    #[test]
    fn proxy_kind_roundtrip() {
        let proxy = ProxyKind::SshJump(JumpHostConfig {
            host: "bastion.internal".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: None,
        });
        let json = serde_json::to_string(&proxy).unwrap();
        assert!(json.contains("\"type\":\"ssh_jump\""));
        let back: ProxyKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary(), "ssh-jump://ops@bastion.internal:22");
    }

    #[test]
    fn russh_config_keepalive() {
        let mut profile = ConnectionProfile::default();
        profile.keepalive = KeepaliveConfig {
            enabled: true,
            interval: 15,
            max_retries: 2,
        };
        let config = profile.to_russh_config();
        assert_eq!(
            config.keepalive_interval,
            Some(std::time::Duration::from_secs(15))
        );
        assert_eq!(config.keepalive_max, 2);
    }
}
