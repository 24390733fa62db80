pub mod capture;
mod classifier;
mod engine;
mod error;
mod flow;
mod interceptor;
mod interface;
pub mod packet;
mod registry;
mod rules;
mod stack;
mod watcher;
mod writer;

pub use classifier::{ProcessClassifier, ProcessNames, SystemProcessNames};
pub use engine::{DiversionEngine, Services};
pub use error::Error;
pub use flow::{FlowKey, Protocol};
pub use interceptor::{PacketInterceptor, Verdict};
#[cfg(windows)]
pub use interface::RoutingTable;
pub use interface::{Egress, InterfaceLookup};
pub use registry::SessionRegistry;
pub use rules::{DomainRules, request_url};
pub use stack::{NetStack, StackCtor, StackFactory};
pub use watcher::IntentWatcher;
pub use writer::{CoalescingWriter, StackOutput};
