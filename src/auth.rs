// 认证器
//
// 在打开网络连接之前完成凭据策略选择与材料准备：
// 身份自动替换、凭据库读取、私钥解码都发生在这里，
// 因此 NoCredential 一类的失败不会消耗任何网络往返。
// 真正向服务器出示凭据发生在握手之后（apply）。

use std::sync::Arc;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::PrivateKeyWithHashAlg;
use tracing::{debug, info, warn};

use crate::config::{AuthType, ConnectionProfile, JumpHostConfig};
use crate::error::SshError;
use crate::handler::ClientHandler;
use crate::stores::{CredentialStore, IdentityStore};

/// 已解析的认证材料
pub enum ResolvedAuth {
    /// 密码认证
    Password(String),
    /// 公钥认证（已解码的私钥）
    PublicKey(Arc<russh::keys::PrivateKey>),
    /// 交互式键盘认证，以密码应答所有提示
    KeyboardInteractive(String),
    /// GSSAPI 被跳过：尝试 none 认证，让服务器回退到其他方法
    None,
}

impl ResolvedAuth {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey(_) => "publickey",
            Self::KeyboardInteractive(_) => "keyboard-interactive",
            Self::None => "none",
        }
    }
}

/// 凭据材料不进入调试输出，只显示方式名
impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// 认证器：凭据策略选择 + 身份自动替换
pub struct Authenticator {
    credentials: Arc<dyn CredentialStore>,
    identities: Arc<dyn IdentityStore>,
}

impl Authenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>, identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            credentials,
            identities,
        }
    }

    /// 为主目标解析认证材料
    ///
    /// 若存在名称等于请求用户名的身份，其认证方式与凭据引用
    /// 覆盖档案自身的认证字段（同名多条时取第一条）。
    pub async fn resolve(&self, profile: &ConnectionProfile) -> Result<ResolvedAuth, SshError> {
        let identity = self
            .identities
            .find_identity_by_username(&profile.username)
            .await;

        let (auth, credential_id) = match &identity {
            Some(identity) => {
                info!(
                    "Substituting identity '{}' for user '{}'",
                    identity.id, profile.username
                );
                (identity.auth.clone(), identity.id.clone())
            }
            None => (profile.auth.clone(), profile.id.clone()),
        };

        self.resolve_strategy(&auth, &credential_id).await
    }

    /// 为跳板机解析认证材料
    ///
    /// 优先匹配跳板机用户名对应的身份；其次用跳板机自己声明的
    /// 认证方式；都没有时与主目标共享密码。
    pub async fn resolve_jump(
        &self,
        profile: &ConnectionProfile,
        jump: &JumpHostConfig,
    ) -> Result<ResolvedAuth, SshError> {
        if let Some(identity) = self
            .identities
            .find_identity_by_username(&jump.username)
            .await
        {
            info!(
                "Substituting identity '{}' for jump host user '{}'",
                identity.id, jump.username
            );
            return self.resolve_strategy(&identity.auth, &identity.id).await;
        }

        match &jump.auth {
            Some(auth) => self.resolve_strategy(auth, &profile.id).await,
            None => {
                debug!("Jump host shares the primary target's password");
                self.resolve_strategy(&AuthType::Password, &profile.id).await
            }
        }
    }

    async fn resolve_strategy(
        &self,
        auth: &AuthType,
        credential_id: &str,
    ) -> Result<ResolvedAuth, SshError> {
        match auth {
            AuthType::Password => {
                let password = self
                    .credentials
                    .get_password(credential_id)
                    .await
                    .ok_or_else(|| {
                        SshError::NoCredential(format!("no password stored for '{}'", credential_id))
                    })?;
                Ok(ResolvedAuth::Password(password))
            }
            AuthType::PublicKey { key_id, passphrase } => {
                let pem = self
                    .credentials
                    .get_private_key(key_id)
                    .await
                    .ok_or_else(|| {
                        SshError::NoCredential(format!("no private key stored for '{}'", key_id))
                    })?;
                let key = russh::keys::decode_secret_key(&pem, passphrase.as_deref())
                    .map_err(|e| SshError::Key(format!("failed to decode key '{}': {}", key_id, e)))?;
                Ok(ResolvedAuth::PublicKey(Arc::new(key)))
            }
            AuthType::KeyboardInteractive => {
                let password = self
                    .credentials
                    .get_password(credential_id)
                    .await
                    .ok_or_else(|| {
                        SshError::NoCredential(format!("no password stored for '{}'", credential_id))
                    })?;
                Ok(ResolvedAuth::KeyboardInteractive(password))
            }
            AuthType::GssApi => {
                warn!("GSSAPI authentication is not supported, skipping");
                Ok(ResolvedAuth::None)
            }
        }
    }
}

/// 向服务器出示已解析的凭据（握手完成之后调用）
pub async fn apply(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    resolved: &ResolvedAuth,
) -> Result<(), SshError> {
    match resolved {
        ResolvedAuth::Password(password) => {
            debug!("Using password authentication");
            let result = handle
                .authenticate_password(username, password.as_str())
                .await
                .map_err(SshError::from)?;
            check_auth_result(result, "Password")
        }
        ResolvedAuth::PublicKey(key) => {
            debug!("Using public key authentication");
            let best_hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(SshError::from)?
                .flatten();
            let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), best_hash);
            let result = handle
                .authenticate_publickey(username, key_with_alg)
                .await
                .map_err(SshError::from)?;
            check_auth_result(result, "Public key")
        }
        ResolvedAuth::KeyboardInteractive(password) => {
            debug!("Using keyboard-interactive authentication");
            keyboard_interactive(handle, username, password).await
        }
        ResolvedAuth::None => {
            debug!("Trying none authentication (GSSAPI skipped)");
            let result = handle
                .authenticate_none(username)
                .await
                .map_err(SshError::from)?;
            check_auth_result(result, "None")
        }
    }
}

/// 交互式键盘认证：以密码应答服务器的每个提示
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<(), SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(SshError::from)?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(()),
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                if partial_success {
                    return Err(SshError::Auth(
                        "Partial authentication - additional auth required".to_string(),
                    ));
                }
                return Err(SshError::Auth(format!(
                    "Keyboard-interactive authentication failed. Server suggests: {:?}",
                    remaining_methods
                )));
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                // 0 个提示时按协议回 0 个应答
                let answers: Vec<String> =
                    prompts.iter().map(|_| password.to_string()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(SshError::from)?;
            }
        }
    }
}

fn check_auth_result(result: AuthResult, method: &str) -> Result<(), SshError> {
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            if partial_success {
                return Err(SshError::Auth(
                    "Partial authentication - additional auth required".to_string(),
                ));
            }
            Err(SshError::Auth(format!(
                "{} authentication failed. Server suggests: {:?}",
                method, remaining_methods
            )))
        }
    }
}
