//! # Early Boot Parameters
//!
//! The allocators are configured before any console or filesystem exists,
//! so their switches come straight from the kernel command line.

use log::warn;

/// How the per-CPU first chunk is laid out.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum FirstChunkKind {
    /// Let the setup code decide.
    #[default]
    Auto,
    /// Embed the first chunk in boot memory (linear mapped).
    Embed,
    /// Map the first chunk page by page.
    ///
    /// Needs the virtual mapping layer, which is not available to this
    /// allocator; setup treats it like [`FirstChunkKind::Embed`].
    Page,
}

impl FirstChunkKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Embed => "embed",
            Self::Page => "page",
        }
    }
}

/// Allocator switches parsed from the command line.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BootParams {
    /// `bootmem_debug`: trace every boot memory operation.
    pub bootmem_debug: bool,
    /// `percpu_alloc=<auto|embed|page>`
    pub percpu_alloc: FirstChunkKind,
}

impl BootParams {
    /// Parse a whitespace-separated command line. Unknown options are
    /// ignored; they belong to other subsystems.
    #[must_use]
    pub fn parse(cmdline: &str) -> Self {
        let mut params = Self::default();
        for option in cmdline.split_ascii_whitespace() {
            let (key, value) = option
                .split_once('=')
                .map_or((option, None), |(k, v)| (k, Some(v)));
            match key {
                "bootmem_debug" => params.bootmem_debug = true,
                "percpu_alloc" => {
                    params.percpu_alloc = match value {
                        Some("auto") => FirstChunkKind::Auto,
                        Some("embed") => FirstChunkKind::Embed,
                        Some("page") => FirstChunkKind::Page,
                        other => {
                            warn!(
                                "PERCPU: unknown allocator {} specified",
                                other.unwrap_or("")
                            );
                            params.percpu_alloc
                        }
                    }
                }
                _ => {}
            }
        }
        params
    }
}
