// Known Hosts 信任库
//
// (host, port) -> 受信主机密钥 的持久映射，TOFU 验证的唯一事实来源。
// 验证本身无副作用；同一 (host, port) 的并发调用经每键互斥锁串行，
// 不同键可以并发。Changed 结果永远不会在这里自动消解，
// 必须由调用方走决议协议拿到显式决定。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::SshError;

/// 验证结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// 指纹与存储一致
    Accepted,
    /// 首次见到该主机
    NewHost,
    /// 指纹变化且新密钥结构有效（潜在 MITM）
    Changed { stored_fingerprint: String },
    /// 指纹变化但新密钥未通过结构校验
    Invalid,
}

/// 信任级别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// 首次连接时接受（TOFU）
    Tofu,
    /// 密钥变化后由用户显式确认
    UserConfirmed,
}

/// 受信主机密钥条目
///
/// 序列化字段集是跨版本稳定的持久化契约。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustedHostKey {
    /// 主机名
    pub host: String,
    /// 端口
    pub port: u16,
    /// 密钥类型（ssh-ed25519, ssh-rsa 等，仅为提示性元数据）
    pub key_type: String,
    /// base64 编码的原始密钥
    pub key_base64: String,
    /// SHA256 指纹
    pub fingerprint: String,
    /// 信任级别
    pub trust_level: TrustLevel,
    /// 首次连接时间
    pub first_seen: String,
    /// 最后验证时间
    pub last_verified: String,
}

impl TrustedHostKey {
    /// 从原始密钥字节构建条目
    pub fn from_key_bytes(host: &str, port: u16, key_bytes: &[u8], level: TrustLevel) -> Self {
        let now = now_string();
        Self {
            host: host.to_string(),
            port,
            key_type: infer_key_type(key_bytes).to_string(),
            key_base64: BASE64.encode(key_bytes),
            fingerprint: fingerprint(key_bytes),
            trust_level: level,
            first_seen: now.clone(),
            last_verified: now,
        }
    }
}

fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 计算密钥指纹：SHA-256 摘要，冒号分隔的十六进制，前缀 `SHA256:`
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    let hex: Vec<String> = hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("SHA256:{}", hex.join(":"))
}

/// 推断密钥类型
///
/// 扫描序列化密钥中的类型标记。SSH wire 格式在密钥 blob 开头以
/// 明文嵌入算法名，所以直接扫描即可。仅作为提示性元数据，
/// 不参与任何密码学验证。
pub fn infer_key_type(key_bytes: &[u8]) -> &'static str {
    let text = String::from_utf8_lossy(key_bytes);
    if text.contains("ssh-ed25519") {
        "ssh-ed25519"
    } else if text.contains("ecdsa-sha2-nistp256") {
        "ecdsa-sha2-nistp256"
    } else if text.contains("ecdsa-sha2-nistp384") {
        "ecdsa-sha2-nistp384"
    } else if text.contains("ecdsa-sha2-nistp521") {
        "ecdsa-sha2-nistp521"
    } else if text.contains("ssh-rsa") || text.contains("rsa") {
        "ssh-rsa"
    } else if text.contains("ssh-dss") || text.contains("dss") {
        "ssh-dss"
    } else {
        "unknown"
    }
}

/// 基础结构校验：长度下限 + 可识别的类型标记
pub fn is_structurally_valid(key_bytes: &[u8]) -> bool {
    key_bytes.len() >= 16 && infer_key_type(key_bytes) != "unknown"
}

/// 信任库持久化契约
///
/// 物理格式由实现方决定；引擎只依赖这三个操作。
pub trait TrustPersistence: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<TrustedHostKey>>;
    fn save(&self, entry: &TrustedHostKey) -> anyhow::Result<()>;
    fn delete(&self, host: &str, port: u16) -> anyhow::Result<()>;
}

/// JSON 文件持久化
///
/// 默认位置：<配置目录>/shellmaster/known_hosts.json
pub struct JsonFileTrust {
    path: PathBuf,
}

/// 磁盘上的文件结构
#[derive(Default, Serialize, Deserialize)]
struct KnownHostsFile {
    hosts: Vec<TrustedHostKey>,
}

impl JsonFileTrust {
    /// 使用默认位置
    pub fn new() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .context("无法获取系统配置目录")?
            .join("shellmaster");
        if !dir.exists() {
            std::fs::create_dir_all(&dir).context("无法创建配置目录")?;
        }
        Ok(Self {
            path: dir.join("known_hosts.json"),
        })
    }

    /// 使用指定路径（测试用）
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn load_file(&self) -> anyhow::Result<KnownHostsFile> {
        if !self.path.exists() {
            return Ok(KnownHostsFile::default());
        }
        let content = std::fs::read_to_string(&self.path).context("无法读取 known_hosts 文件")?;
        let file: KnownHostsFile =
            serde_json::from_str(&content).context("无法解析 known_hosts 文件")?;
        Ok(file)
    }

    fn save_file(&self, file: &KnownHostsFile) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(file).context("无法序列化 known_hosts")?;
        std::fs::write(&self.path, content).context("无法写入 known_hosts 文件")?;
        Ok(())
    }
}

impl TrustPersistence for JsonFileTrust {
    fn load(&self) -> anyhow::Result<Vec<TrustedHostKey>> {
        Ok(self.load_file()?.hosts)
    }

    fn save(&self, entry: &TrustedHostKey) -> anyhow::Result<()> {
        let mut file = self.load_file()?;
        match file
            .hosts
            .iter()
            .position(|h| h.host == entry.host && h.port == entry.port)
        {
            Some(pos) => file.hosts[pos] = entry.clone(),
            None => file.hosts.push(entry.clone()),
        }
        self.save_file(&file)
    }

    fn delete(&self, host: &str, port: u16) -> anyhow::Result<()> {
        let mut file = self.load_file()?;
        file.hosts.retain(|h| !(h.host == host && h.port == port));
        self.save_file(&file)
    }
}

type HostPort = (String, u16);

/// 信任库
///
/// 所有控制器共享一个实例。
pub struct TrustStore {
    /// 内存中的条目缓存
    entries: RwLock<HashMap<HostPort, TrustedHostKey>>,
    /// 每键互斥锁，序列化同一 (host, port) 的验证与写入
    key_locks: Mutex<HashMap<HostPort, Arc<tokio::sync::Mutex<()>>>>,
    persistence: Arc<dyn TrustPersistence>,
}

impl TrustStore {
    /// 创建信任库并从持久化层加载
    pub fn new(persistence: Arc<dyn TrustPersistence>) -> Self {
        let mut entries = HashMap::new();
        match persistence.load() {
            Ok(hosts) => {
                for entry in hosts {
                    entries.insert((entry.host.clone(), entry.port), entry);
                }
                info!("Loaded {} known host entries", entries.len());
            }
            Err(e) => {
                warn!("Failed to load known hosts: {}", e);
            }
        }
        Self {
            entries: RwLock::new(entries),
            key_locks: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    fn key_lock(&self, host: &str, port: u16) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap();
        locks
            .entry((host.to_string(), port))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 验证主机展示的公钥
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        key_bytes: &[u8],
        presented_fingerprint: &str,
    ) -> VerificationOutcome {
        let lock = self.key_lock(host, port);
        let _guard = lock.lock().await;

        let stored = {
            let entries = self.entries.read().unwrap();
            entries.get(&(host.to_string(), port)).cloned()
        };

        match stored {
            None => {
                debug!("Unknown host: {}:{}", host, port);
                VerificationOutcome::NewHost
            }
            Some(entry) if entry.fingerprint == presented_fingerprint => {
                debug!("Host key verified for {}:{}", host, port);
                // 只更新最后验证时间，密钥本体不动
                let mut touched = entry.clone();
                touched.last_verified = now_string();
                self.entries
                    .write()
                    .unwrap()
                    .insert((host.to_string(), port), touched.clone());
                if let Err(e) = self.persistence.save(&touched) {
                    warn!("Failed to persist last-verified timestamp: {}", e);
                }
                VerificationOutcome::Accepted
            }
            Some(entry) => {
                if !is_structurally_valid(key_bytes) {
                    warn!(
                        "Host {}:{} presented a malformed key ({} bytes)",
                        host,
                        port,
                        key_bytes.len()
                    );
                    VerificationOutcome::Invalid
                } else {
                    warn!(
                        "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                        host, port, entry.fingerprint, presented_fingerprint
                    );
                    VerificationOutcome::Changed {
                        stored_fingerprint: entry.fingerprint,
                    }
                }
            }
        }
    }

    /// 记住一个主机密钥（仅在用户显式接受后调用）
    pub async fn remember(&self, entry: TrustedHostKey) -> Result<(), SshError> {
        let lock = self.key_lock(&entry.host, entry.port);
        let _guard = lock.lock().await;

        self.persistence
            .save(&entry)
            .map_err(|e| SshError::Storage(e.to_string()))?;
        info!(
            "Stored host key for {}:{} ({}, {:?})",
            entry.host, entry.port, entry.key_type, entry.trust_level
        );
        self.entries
            .write()
            .unwrap()
            .insert((entry.host.clone(), entry.port), entry);
        Ok(())
    }

    /// 遗忘一个主机
    pub async fn forget(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lock = self.key_lock(host, port);
        {
            let _guard = lock.lock().await;

            self.persistence
                .delete(host, port)
                .map_err(|e| SshError::Storage(e.to_string()))?;
            self.entries
                .write()
                .unwrap()
                .remove(&(host.to_string(), port));
            info!("Removed host key for {}:{}", host, port);
        }

        // 回收该键的锁条目；强计数 2 = 锁表 + 本地克隆，没有并发使用者。
        // 计数更高说明有人正持有或等待，条目留待下次遗忘时回收。
        let mut locks = self.key_locks.lock().unwrap();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&(host.to_string(), port));
        }
        Ok(())
    }

    /// 列出所有条目
    pub fn list_all(&self) -> Vec<TrustedHostKey> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn key_lock_count(&self) -> usize {
        self.key_locks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// 构造一段带类型标记的假密钥 blob（wire 格式风格）
    fn fake_key(marker: &str, filler: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(marker.len() as u32).to_be_bytes());
        bytes.extend_from_slice(marker.as_bytes());
        bytes.extend_from_slice(&[filler; 32]);
        bytes
    }

    fn store(dir: &tempfile::TempDir) -> TrustStore {
        let persistence = JsonFileTrust::with_path(dir.path().join("known_hosts.json"));
        TrustStore::new(Arc::new(persistence))
    }

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint(b"hello");
        assert!(fp.starts_with("SHA256:"));
        // 32 字节摘要 = 32 组十六进制，冒号分隔
        assert_eq!(fp.trim_start_matches("SHA256:").split(':').count(), 32);
        assert_eq!(fp, fingerprint(b"hello"));
        assert_ne!(fp, fingerprint(b"world"));
    }

    #[test]
    fn key_type_inference() {
        assert_eq!(infer_key_type(&fake_key("ssh-ed25519", 1)), "ssh-ed25519");
        assert_eq!(infer_key_type(&fake_key("ssh-rsa", 1)), "ssh-rsa");
        assert_eq!(
            infer_key_type(&fake_key("ecdsa-sha2-nistp256", 1)),
            "ecdsa-sha2-nistp256"
        );
        assert_eq!(infer_key_type(&fake_key("ssh-dss", 1)), "ssh-dss");
        assert_eq!(infer_key_type(&[0u8; 64]), "unknown");
    }

    #[tokio::test]
    async fn tofu_cycle() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = fake_key("ssh-ed25519", 1);
        let fp = fingerprint(&key);

        // 未见过的主机
        assert_eq!(
            store.verify("10.0.0.5", 22, &key, &fp).await,
            VerificationOutcome::NewHost
        );

        // 记住后再次验证
        let entry = TrustedHostKey::from_key_bytes("10.0.0.5", 22, &key, TrustLevel::Tofu);
        store.remember(entry).await.unwrap();
        assert_eq!(
            store.verify("10.0.0.5", 22, &key, &fp).await,
            VerificationOutcome::Accepted
        );
        assert_eq!(store.list_all().len(), 1);
    }

    #[tokio::test]
    async fn changed_key_detected() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let original = fake_key("ssh-ed25519", 1);
        let entry = TrustedHostKey::from_key_bytes("server", 2222, &original, TrustLevel::Tofu);
        let stored_fp = entry.fingerprint.clone();
        store.remember(entry).await.unwrap();

        // 结构有效的新密钥 -> Changed，携带旧指纹
        let replaced = fake_key("ssh-rsa", 9);
        let outcome = store
            .verify("server", 2222, &replaced, &fingerprint(&replaced))
            .await;
        assert_eq!(
            outcome,
            VerificationOutcome::Changed {
                stored_fingerprint: stored_fp
            }
        );

        // 原密钥依然 Accepted
        assert_eq!(
            store
                .verify("server", 2222, &original, &fingerprint(&original))
                .await,
            VerificationOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn malformed_key_is_invalid() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let original = fake_key("ssh-ed25519", 1);
        store
            .remember(TrustedHostKey::from_key_bytes(
                "server",
                22,
                &original,
                TrustLevel::Tofu,
            ))
            .await
            .unwrap();

        let garbage = vec![0u8; 8];
        assert_eq!(
            store
                .verify("server", 22, &garbage, &fingerprint(&garbage))
                .await,
            VerificationOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = fake_key("ssh-ed25519", 1);
        store
            .remember(TrustedHostKey::from_key_bytes(
                "server",
                22,
                &key,
                TrustLevel::Tofu,
            ))
            .await
            .unwrap();

        store.forget("server", 22).await.unwrap();
        assert_eq!(
            store.verify("server", 22, &key, &fingerprint(&key)).await,
            VerificationOutcome::NewHost
        );
        assert!(store.list_all().is_empty());
    }

    #[tokio::test]
    async fn forget_reclaims_key_lock() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = fake_key("ssh-ed25519", 1);

        store.verify("server", 22, &key, &fingerprint(&key)).await;
        store
            .remember(TrustedHostKey::from_key_bytes(
                "server",
                22,
                &key,
                TrustLevel::Tofu,
            ))
            .await
            .unwrap();
        assert_eq!(store.key_lock_count(), 1);

        store.forget("server", 22).await.unwrap();
        assert_eq!(store.key_lock_count(), 0);

        // 回收后同键仍可正常工作
        assert_eq!(
            store.verify("server", 22, &key, &fingerprint(&key)).await,
            VerificationOutcome::NewHost
        );
    }

    #[tokio::test]
    async fn entries_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        let key = fake_key("ssh-rsa", 3);

        {
            let store = TrustStore::new(Arc::new(JsonFileTrust::with_path(path.clone())));
            store
                .remember(TrustedHostKey::from_key_bytes(
                    "db01",
                    22,
                    &key,
                    TrustLevel::UserConfirmed,
                ))
                .await
                .unwrap();
        }

        let store = TrustStore::new(Arc::new(JsonFileTrust::with_path(path)));
        assert_eq!(
            store.verify("db01", 22, &key, &fingerprint(&key)).await,
            VerificationOutcome::Accepted
        );
        let all = store.list_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].trust_level, TrustLevel::UserConfirmed);
        assert_eq!(all[0].key_type, "ssh-rsa");
    }

    #[tokio::test]
    async fn different_ports_are_distinct() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = fake_key("ssh-ed25519", 5);
        store
            .remember(TrustedHostKey::from_key_bytes(
                "server",
                22,
                &key,
                TrustLevel::Tofu,
            ))
            .await
            .unwrap();

        assert_eq!(
            store
                .verify("server", 2222, &key, &fingerprint(&key))
                .await,
            VerificationOutcome::NewHost
        );
    }
}
