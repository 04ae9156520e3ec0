// Validation of individual path components before they reach the filesystem

use crate::error::{Error, Result};

/// Longest component accepted on any supported filesystem.
pub const MAX_COMPONENT_LEN: usize = 255;

const WINDOWS_FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "con", "prn", "nul", "aux", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Rule set applied by [`validate_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// Validate a single path component using the rules of the host platform.
pub fn validate(component: &str) -> Result<()> {
    validate_for(component, Platform::current())
}

/// Validate a single path component against the rules of `platform`.
///
/// A component is a single file or directory name, never a path: separators
/// are rejected on every platform.
pub fn validate_for(component: &str, platform: Platform) -> Result<()> {
    let invalid = |reason: &'static str| Error::InvalidPath {
        component: component.to_string(),
        reason,
    };

    if component.len() > MAX_COMPONENT_LEN {
        return Err(invalid("longer than 255 bytes"));
    }
    if component.trim().is_empty() {
        return Err(invalid("empty"));
    }

    match platform {
        Platform::Posix => {
            if component == "." || component == ".." {
                return Err(invalid("traversal component"));
            }
            if component.contains('\0') {
                return Err(invalid("contains a null byte"));
            }
            if component.contains('/') {
                return Err(invalid("contains a path separator"));
            }
        }
        Platform::Windows => {
            if component.chars().any(|c| (c as u32) < 0x20) {
                return Err(invalid("contains a control character"));
            }
            if component.contains(WINDOWS_FORBIDDEN_CHARS) {
                return Err(invalid("contains a reserved character"));
            }
            if component.ends_with(' ') || component.ends_with('.') {
                return Err(invalid("ends with a space or a dot"));
            }
            // Device names are reserved with or without an extension ("con", "con.txt")
            let stem = component
                .split('.')
                .next()
                .unwrap_or(component)
                .to_ascii_lowercase();
            if WINDOWS_RESERVED_NAMES.contains(&stem.as_str()) {
                return Err(invalid("reserved device name"));
            }
        }
    }

    Ok(())
}
