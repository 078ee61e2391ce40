mod captcha;
mod check;
mod health;
mod metrics;
mod record;
mod reset;

pub use captcha::{captcha_config_handler, verify_captcha_handler};
pub use check::check_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use record::record_handler;
pub use reset::reset_handler;
