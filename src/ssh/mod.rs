mod keys;
mod relay;
mod server;
mod session;

pub use keys::{fingerprint_of, load_or_generate_host_key, parse_authorized_key};
pub use server::{HANDSHAKE_TIMEOUT, SshServer};
pub use session::{ExecPlan, SshSession, plan_exec};
