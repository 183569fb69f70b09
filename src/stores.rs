// 外部协作方契约
//
// 凭据库、身份库与预连接敲门钩子都由宿主注入，
// 引擎只消费这些接口，不关心其物理实现。

use async_trait::async_trait;

use crate::config::AuthType;

/// 身份：可复用的命名凭据束，与单个连接档案解耦
#[derive(Clone, Debug)]
pub struct Identity {
    /// 身份 ID（凭据库的查找键）
    pub id: String,
    /// 身份名称（与用户名匹配时触发自动替换）
    pub name: String,
    /// 该身份的认证方式
    pub auth: AuthType,
}

/// 安全凭据库
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 按档案/身份 ID 获取密码；不存在返回 None
    async fn get_password(&self, profile_id: &str) -> Option<String>;
    /// 按密钥 ID 获取私钥材料（OpenSSH/PEM 文本）；不存在返回 None
    async fn get_private_key(&self, key_id: &str) -> Option<String>;
}

/// 身份库
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// 按名称查找身份；同名多条时返回第一条
    async fn find_identity_by_username(&self, name: &str) -> Option<Identity>;
}

/// 预连接敲门钩子
///
/// 失败只记录日志，连接照常进行。
#[async_trait]
pub trait KnockSequence: Send + Sync {
    async fn run_knock_sequence(&self, host: &str) -> bool;
}
