// SSH 连接事件定义

use chrono::{DateTime, Local};

use crate::error::ErrorInfo;

/// 连接状态
///
/// 由单个 ConnectionController 独占持有，外部只能观察不能修改。
/// Error 可从前三个状态到达；重试会将其重置回 Connecting。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Connected => "Connected",
            Self::Error => "Error",
        }
    }
}

/// 连接事件（用于 UI 显示）
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// 状态机迁移
    StateChanged(ConnectionState),
    /// 细粒度阶段变化（连接页进度条）
    StageChanged(ConnectionStage),
    /// 日志消息
    Log(LogEntry),
    /// 连接成功
    Connected { session_id: String },
    /// 连接失败
    Failed { error: ErrorInfo },
    /// 连接断开
    Disconnected { reason: String },
}

/// 会话池级别事件，镜像控制器事件并附带档案 ID
#[derive(Clone, Debug)]
pub struct SessionEvent {
    pub profile_id: String,
    pub kind: SessionEventKind,
}

#[derive(Clone, Debug)]
pub enum SessionEventKind {
    /// 会话建立
    Established { session_id: String },
    /// 会话建立失败
    Failed { error: ErrorInfo },
    /// 会话关闭
    Closed,
    /// 控制器状态迁移
    StateChanged(ConnectionState),
}

/// 连接阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStage {
    /// 初始化（解析配置、准备连接）
    Initializing = 0,
    /// 连接代理（如果配置了代理）
    ConnectingProxy = 1,
    /// 连接跳板机（如果配置了跳板机）
    ConnectingJumpHost = 2,
    /// TCP 连接目标主机
    ConnectingHost = 3,
    /// SSH 握手（密钥交换、主机密钥验证）
    Handshaking = 4,
    /// 身份认证
    Authenticating = 5,
    /// 建立安全通道
    EstablishingChannel = 6,
    /// 连接完成
    Connected = 7,
}

impl ConnectionStage {
    /// 阶段名称
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ConnectingProxy => "Connecting to proxy",
            Self::ConnectingJumpHost => "Connecting to jump host",
            Self::ConnectingHost => "Connecting to host",
            Self::Handshaking => "SSH handshake",
            Self::Authenticating => "Authenticating",
            Self::EstablishingChannel => "Establishing channel",
            Self::Connected => "Connected",
        }
    }

    /// 获取进度百分比 (0.0 - 1.0)
    pub fn progress(&self) -> f32 {
        match self {
            Self::Initializing => 0.0,
            Self::ConnectingProxy => 0.1,
            Self::ConnectingJumpHost => 0.2,
            Self::ConnectingHost => 0.3,
            Self::Handshaking => 0.5,
            Self::Authenticating => 0.7,
            Self::EstablishingChannel => 0.85,
            Self::Connected => 1.0,
        }
    }
}

/// 日志级别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// 日志条目
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// 时间戳
    pub timestamp: DateTime<Local>,
    /// 日志级别
    pub level: LogLevel,
    /// 消息内容
    pub message: String,
    /// 详细信息（可选）
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        level: LogLevel,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}
