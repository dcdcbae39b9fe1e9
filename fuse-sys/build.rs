#[cfg(feature = "libfuse")]
#[cfg(not(target_os = "macos"))]
const LIBFUSE_NAME: &str = "fuse";

#[cfg(feature = "libfuse")]
#[cfg(target_os = "macos")]
const LIBFUSE_NAME: &str = "osxfuse";

fn main() {
    // Without libfuse the crate only provides type definitions and nothing needs linking
    #[cfg(feature = "libfuse")]
    {
        if let Err(err) = pkg_config::Config::new().atleast_version("2.6.0").probe(LIBFUSE_NAME) {
            panic!("libfuse not found ({}). Install `libfuse-dev` (Linux) or `osxfuse` (macOS).", err);
        }
    }
}
