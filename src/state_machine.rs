//! 连接状态机模块
//!
//! 跟踪 WiFi 与 MQTT broker 的连接阶段、当前使用的接入点以及 `live` 标志

use log::{info, warn};

/// 连接阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    // 初始状态
    Idle,

    // WiFi 阶段
    AttachingWireless,
    WirelessAttached,
    WirelessFailed,

    // Broker 阶段
    AttachingBroker,
    BrokerAttached,
    BrokerFailed,
}

/// 连接事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    // WiFi 事件
    WirelessAttachStarted,
    WirelessJoined { candidate: usize },
    WirelessAttachFailed,

    // Broker 事件
    BrokerAttachStarted,
    BrokerConnected,
    BrokerConnectFailed,
}

/// 状态转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// 保持当前状态
    Stay,
    /// 转换到新状态
    Transition(ConnectionMode),
    /// 转换到新状态并重置重试计数
    TransitionWithReset(ConnectionMode),
}

/// 连接状态
///
/// `live` 在 broker 首次连接成功后置位，只有重新开始 WiFi 连接才会清除。
/// broker 重连失败不会清除它，主循环因此会继续重试。
#[derive(Debug, Clone)]
pub struct ConnectionState {
    mode: ConnectionMode,
    previous_mode: Option<ConnectionMode>,
    live: bool,
    active_candidate: Option<usize>,
    retry_count: u32,
    max_retries: u32,
}

impl ConnectionState {
    /// 创建新的状态实例，`max_retries` 为每个接入点的轮询次数上限
    pub fn new(max_retries: u32) -> Self {
        Self {
            mode: ConnectionMode::Idle,
            previous_mode: None,
            live: false,
            active_candidate: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// 获取当前状态
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// 获取上一个状态
    pub fn previous_mode(&self) -> Option<ConnectionMode> {
        self.previous_mode
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// 已连接的接入点在配置中的序号
    pub fn active_candidate(&self) -> Option<usize> {
        self.active_candidate
    }

    /// 获取重试次数
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 处理连接事件
    pub fn handle_event(&mut self, event: ConnectionEvent) -> StateTransition {
        let transition = self.get_state_transition(self.mode, event);

        match transition {
            StateTransition::Transition(new_mode) => {
                self.transition_to(new_mode);
            }
            StateTransition::TransitionWithReset(new_mode) => {
                self.retry_count = 0;
                self.transition_to(new_mode);
            }
            StateTransition::Stay => {
                warn!("[STATE] Ignored {:?} in {:?}", event, self.mode);
                return transition;
            }
        }

        match event {
            ConnectionEvent::WirelessAttachStarted => {
                self.live = false;
                self.active_candidate = None;
            }
            ConnectionEvent::WirelessJoined { candidate } => {
                self.active_candidate = Some(candidate);
            }
            ConnectionEvent::BrokerConnected => {
                self.live = true;
            }
            _ => {}
        }

        transition
    }

    fn transition_to(&mut self, new_mode: ConnectionMode) {
        if new_mode != self.mode {
            match new_mode {
                ConnectionMode::BrokerAttached => info!("[STATE] Bridge online"),
                ConnectionMode::WirelessFailed | ConnectionMode::BrokerFailed => {
                    warn!("[STATE] Error state: {:?}", new_mode);
                }
                _ => {}
            }

            self.previous_mode = Some(self.mode);
            self.mode = new_mode;
        }
    }

    /// 获取状态转换规则
    fn get_state_transition(
        &self,
        current: ConnectionMode,
        event: ConnectionEvent,
    ) -> StateTransition {
        match (current, event) {
            // 任何时候都可以重新开始 WiFi 连接
            (_, ConnectionEvent::WirelessAttachStarted) => {
                StateTransition::TransitionWithReset(ConnectionMode::AttachingWireless)
            }

            (ConnectionMode::AttachingWireless, ConnectionEvent::WirelessJoined { .. }) => {
                StateTransition::TransitionWithReset(ConnectionMode::WirelessAttached)
            }
            (ConnectionMode::AttachingWireless, ConnectionEvent::WirelessAttachFailed) => {
                StateTransition::Transition(ConnectionMode::WirelessFailed)
            }

            // Broker 连接需要 WiFi 已连接
            (
                ConnectionMode::WirelessAttached
                | ConnectionMode::BrokerAttached
                | ConnectionMode::BrokerFailed,
                ConnectionEvent::BrokerAttachStarted,
            ) => StateTransition::Transition(ConnectionMode::AttachingBroker),

            (ConnectionMode::AttachingBroker, ConnectionEvent::BrokerConnected) => {
                StateTransition::TransitionWithReset(ConnectionMode::BrokerAttached)
            }
            (ConnectionMode::AttachingBroker, ConnectionEvent::BrokerConnectFailed) => {
                StateTransition::Transition(ConnectionMode::BrokerFailed)
            }

            // 默认情况：保持当前状态
            _ => StateTransition::Stay,
        }
    }

    /// 检查是否需要重试
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 增加重试计数
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// 重置重试计数
    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }
}
