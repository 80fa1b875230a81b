//! Device-specific frame handlers.
//!
//! A handler sees every delimited frame after the generic summary and
//! logging pass, and can ask the listener to stop its connection loop
//! once it has captured what it needs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{GatewayConfig, SubMode};
use crate::dustiq::DustIqHandler;
use crate::frame::FrameSummary;
use crate::storage::StorageManager;

/// What the listener should do after a handler saw a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    /// Tear down the connection and stop the gateway task.
    Stop,
}

#[async_trait]
pub trait DeviceHandler: Send {
    /// Called once per delimited frame, after generic logging.
    async fn on_frame(&mut self, frame: &[u8], summary: &FrameSummary) -> HandlerFlow;

    /// Called when the connection drops; partial state should be discarded.
    fn on_disconnect(&mut self) {}
}

/// Build the handler matching a gateway's `device_type`, if any.
pub fn for_gateway(
    gateway: &GatewayConfig,
    sub_mode: SubMode,
    storage: Option<Arc<StorageManager>>,
) -> Option<Box<dyn DeviceHandler>> {
    let device_type = gateway.device_type.as_deref()?.trim().to_ascii_lowercase();
    match device_type.as_str() {
        "dustiq" => Some(Box::new(DustIqHandler::new(
            gateway.name.clone(),
            sub_mode,
            storage,
        ))),
        _ => None,
    }
}
