use tracing_subscriber::EnvFilter;

fn default_directives(binary: &str) -> String {
    format!("relaytube_tools=info,{binary}=info")
}

/// Installs the global fmt subscriber. `RUST_LOG` replaces the default
/// filter when set.
pub fn init_tracing(binary: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(binary)));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_library_and_binary() {
        assert_eq!(
            default_directives("uploader"),
            "relaytube_tools=info,uploader=info"
        );
        assert!(EnvFilter::try_new(default_directives("collector")).is_ok());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing("collector");
        init_tracing("collector");
    }
}
