//! Build identity, stamped into shared render data and logged at startup.

pub const NAME: &str = "d-template";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git sha of the build, when built from a checkout.
pub const GIT_SHA: Option<&str> = option_env!("VERGEN_GIT_SHA");

/// e.g. `d-template v0.1.0 (1a2b3c4)`
pub fn human_version() -> String {
    match GIT_SHA {
        Some(sha) if !sha.is_empty() => {
            let short = sha.get(..7).unwrap_or(sha);
            format!("{NAME} v{VERSION} ({short})")
        }
        _ => format!("{NAME} v{VERSION}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_version_starts_with_name_and_version() {
        let v = human_version();
        assert!(v.starts_with(&format!("{NAME} v{VERSION}")), "{v}");
    }
}
