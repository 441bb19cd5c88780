//! The browser-extension counterpart of the broker: a WebSocket client
//! router with per-client session context, alarm-driven reconnect, and
//! the secure-evaluation validator. Host facilities (tabs, debugger,
//! alarms, storage, badge) are traits so the router runs against real
//! browser surfaces in production and scripted fakes in tests.

pub mod badge;
pub mod host;
pub mod membrane;
pub mod router;
pub mod session;
pub mod whitelist;

pub use host::{
    AlarmScheduler, BadgeSurface, BrowserHost, FileSessionStore, HostTab, InMemorySessionStore,
    LogBadge, ManualAlarms, SessionStore, TokioAlarms,
};
pub use router::{
    DRIFT_ALARM, ExtensionRouter, RECONNECT_ALARM, RECONNECT_DELAY, RouterConfig, RouterShared,
};
pub use session::{CursorPosition, HumanizationConfig, Session, SessionContext};
