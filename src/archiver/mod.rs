pub mod audit;
pub mod batch;
pub mod config;
pub mod item;
pub mod ledger;
pub mod locator;
pub mod lock;
pub mod naming;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod retry;
pub mod util;
pub mod warn;

#[cfg(test)]
pub mod test_support;
