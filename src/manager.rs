// 会话池管理器
//
// 按档案 ID 维护连接控制器池：同一档案的活跃会话被复用，
// 失败或关闭后的控制器留在池中供重连。没有进程级单例，
// 管理器由宿主构造并注入共享组件。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::config::ConnectionProfile;
use crate::controller::{ConnectionController, ControllerDeps};
use crate::decision::{HostKeyResolver, DECISION_TIMEOUT};
use crate::error::ErrorInfo;
use crate::event::{ConnectionEvent, ConnectionState, SessionEvent, SessionEventKind};
use crate::known_hosts::TrustStore;
use crate::session::SshSession;
use crate::stores::KnockSequence;

/// 会话池事件通道容量
const EVENT_CAPACITY: usize = 256;

/// 池统计
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// 池中控制器总数
    pub total: usize,
    /// 处于 Connected 的数量
    pub connected: usize,
}

/// 会话池管理器
pub struct SessionManager {
    trust: Arc<TrustStore>,
    authenticator: Arc<Authenticator>,
    resolver: Option<Arc<dyn HostKeyResolver>>,
    knock: Option<Arc<dyn KnockSequence>>,
    decision_wait: Duration,
    /// 档案 ID -> 控制器
    controllers: Mutex<HashMap<String, Arc<ConnectionController>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(trust: Arc<TrustStore>, authenticator: Arc<Authenticator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            trust,
            authenticator,
            resolver: None,
            knock: None,
            decision_wait: DECISION_TIMEOUT,
            controllers: Mutex::new(HashMap::new()),
            events,
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

    /// 订阅池级事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn build_deps(&self) -> ControllerDeps {
        let mut deps = ControllerDeps::new(self.trust.clone(), self.authenticator.clone())
            .with_decision_wait(self.decision_wait);
        if let Some(resolver) = &self.resolver {
            deps = deps.with_resolver(resolver.clone());
        }
        if let Some(knock) = &self.knock {
            deps = deps.with_knock(knock.clone());
        }
        deps
    }

    /// 取出或创建档案的控制器，并接上事件转发
    async fn controller_for(&self, profile: &ConnectionProfile) -> Arc<ConnectionController> {
        let mut controllers = self.controllers.lock().await;
        if let Some(controller) = controllers.get(&profile.id) {
            return controller.clone();
        }

        let (controller, event_rx) = ConnectionController::new(profile.clone(), self.build_deps());
        let controller = Arc::new(controller);
        controllers.insert(profile.id.clone(), controller.clone());

        // 控制器事件镜像为池级事件
        let profile_id = profile.id.clone();
        let events = self.events.clone();
        tokio::spawn(forward_events(profile_id, event_rx, events));

        debug!("Created controller for profile {}", profile.id);
        controller
    }

    /// 打开（或复用）档案对应的会话
    ///
    /// 已有活跃会话时直接返回；同一档案的并发调用最多建立一条连接。
    pub async fn open(&self, profile: &ConnectionProfile) -> Result<Arc<SshSession>, ErrorInfo> {
        let controller = self.controller_for(profile).await;

        if controller.state() == ConnectionState::Connected {
            if let Some(session) = controller.session().await {
                if session.is_alive() {
                    debug!("Reusing live session for profile {}", profile.id);
                    return Ok(session);
                }
            }
            // 会话已死但状态残留，先复位再重连
            info!("Stale session for profile {}, reconnecting", profile.id);
            controller.disconnect().await;
        }

        match controller.connect().await {
            Ok(session) => Ok(session),
            Err(info) => {
                // 并发打开时输掉竞争的一方在这里拿到赢家的会话
                if let Some(session) = controller.session().await {
                    if session.is_alive() {
                        return Ok(session);
                    }
                }
                Err(info)
            }
        }
    }

    /// 档案当前的活跃会话
    pub async fn session(&self, profile_id: &str) -> Option<Arc<SshSession>> {
        let controller = {
            let controllers = self.controllers.lock().await;
            controllers.get(profile_id).cloned()
        }?;
        controller.session().await
    }

    /// 列出池中所有档案及其状态
    pub async fn list(&self) -> Vec<(String, ConnectionState)> {
        let controllers = self.controllers.lock().await;
        controllers
            .iter()
            .map(|(id, c)| (id.clone(), c.state()))
            .collect()
    }

    /// 关闭档案的会话（控制器保留，供重连）
    pub async fn close(&self, profile_id: &str) {
        let controller = {
            let controllers = self.controllers.lock().await;
            controllers.get(profile_id).cloned()
        };
        if let Some(controller) = controller {
            controller.disconnect().await;
            info!("Closed session for profile {}", profile_id);
        }
    }

    /// 移除档案的控制器
    pub async fn remove(&self, profile_id: &str) {
        let controller = self.controllers.lock().await.remove(profile_id);
        if let Some(controller) = controller {
            controller.disconnect().await;
            info!("Removed profile {} from pool", profile_id);
        }
    }

    /// 清理池：逐出所有处于 Disconnected 的控制器，返回逐出数量
    pub async fn maintenance(&self) -> usize {
        let mut controllers = self.controllers.lock().await;
        let before = controllers.len();
        controllers.retain(|_, c| c.state() != ConnectionState::Disconnected);
        let evicted = before - controllers.len();
        if evicted > 0 {
            debug!("Evicted {} idle controllers from pool", evicted);
        }
        evicted
    }

    /// 池统计
    pub async fn stats(&self) -> PoolStats {
        let controllers = self.controllers.lock().await;
        let connected = controllers
            .values()
            .filter(|c| c.state() == ConnectionState::Connected)
            .count();
        PoolStats {
            total: controllers.len(),
            connected,
        }
    }

    /// 关闭全部会话
    pub async fn close_all(&self) {
        let controllers: Vec<_> = {
            let map = self.controllers.lock().await;
            map.values().cloned().collect()
        };
        for controller in controllers {
            controller.disconnect().await;
        }
        info!("All sessions closed");
    }

    #[cfg(test)]
    pub(crate) async fn pooled_count(&self) -> usize {
        self.controllers.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn pooled_controller(
        &self,
        profile_id: &str,
    ) -> Option<Arc<ConnectionController>> {
        self.controllers.lock().await.get(profile_id).cloned()
    }
}

/// 把控制器事件镜像为池级事件
async fn forward_events(
    profile_id: String,
    mut event_rx: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let kind = match event {
            ConnectionEvent::StateChanged(state) => SessionEventKind::StateChanged(state),
            ConnectionEvent::Connected { session_id } => {
                SessionEventKind::Established { session_id }
            }
            ConnectionEvent::Failed { error } => SessionEventKind::Failed { error },
            ConnectionEvent::Disconnected { .. } => SessionEventKind::Closed,
            // 日志与阶段事件不进池级通道
            ConnectionEvent::Log(_) | ConnectionEvent::StageChanged(_) => continue,
        };
        let _ = events.send(SessionEvent {
            profile_id: profile_id.clone(),
            kind,
        });
    }
}
