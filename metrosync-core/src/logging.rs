//! Process-wide log output

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

const DEFAULT_DIRECTIVES: &[&str] = &[
    "metrosync_core=debug",
    "libp2p_mdns=info",
    "libp2p_swarm=info",
    "libp2p_tcp=info",
];

/// Install the stderr subscriber with the default filter. Later calls do nothing.
pub fn init() {
    init_with(&[]);
}

/// Like [`init`], with extra filter directives such as `"metrosync_node=info"`.
/// Directives that fail to parse are skipped.
pub fn init_with(extra_directives: &[&str]) {
    TRACING_INIT.call_once(|| {
        let filter = DEFAULT_DIRECTIVES
            .iter()
            .chain(extra_directives)
            .filter_map(|directive| directive.parse().ok())
            .fold(EnvFilter::from_default_env(), EnvFilter::add_directive);

        // Another subscriber may already be installed by the host app
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Xcode and logcat show escapes verbatim
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
