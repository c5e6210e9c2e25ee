//! On-disk layout rooted at the directory of the engine file.

use std::path::{Component, Path, PathBuf};

const SERVE_DIR: &[&str] = &["export", "serve"];
const MAX_FILE_STEM: usize = 200;

/// Directory containing the engine file; every request artifact lives below it.
pub fn base_dir(hip: &Path) -> PathBuf {
    match hip.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// One spelling per directory: the canonical path when it exists, otherwise
/// the absolute path with `.` and `..` folded lexically.
pub fn normalize_dir(dir: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(dir) {
        return canonical;
    }

    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(dir))
            .unwrap_or_else(|_| dir.to_path_buf())
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

pub fn serve_dir(base: &Path) -> PathBuf {
    SERVE_DIR.iter().fold(base.to_path_buf(), |dir, part| dir.join(part))
}

pub fn pixel_json_path(base: &Path, uuid: &str) -> PathBuf {
    serve_dir(base).join(format!("{uuid}.json"))
}

pub fn raster_path(base: &Path, uuid: &str) -> PathBuf {
    serve_dir(base).join(format!("{uuid}.png"))
}

pub fn detail_log_path(base: &Path, uuid: &str) -> PathBuf {
    serve_dir(base)
        .join("log")
        .join("detail")
        .join(format!("{uuid}.json"))
}

pub fn user_log_path(base: &Path, user_id: &str) -> PathBuf {
    serve_dir(base)
        .join("log")
        .join("users")
        .join(format!("{}.json", safe_filename(user_id)))
}

/// Maps an arbitrary identifier onto a portable file stem.
pub fn safe_filename(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '+' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILE_STEM)
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A uuid becomes part of several file names, so it must stay a single
/// plain path component.
pub fn is_safe_uuid(uuid: &str) -> bool {
    let uuid = uuid.trim();
    !uuid.is_empty()
        && !uuid.contains(['/', '\\'])
        && !uuid.contains("..")
        && !uuid.chars().any(char::is_control)
        && matches!(Path::new(uuid).components().next(), Some(Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_hang_off_the_engine_file_directory() {
        let base = base_dir(Path::new("/proj/scenes/room.hip"));
        assert_eq!(base, PathBuf::from("/proj/scenes"));

        assert_eq!(
            pixel_json_path(&base, "U1"),
            PathBuf::from("/proj/scenes/export/serve/U1.json")
        );
        assert_eq!(
            raster_path(&base, "U1"),
            PathBuf::from("/proj/scenes/export/serve/U1.png")
        );
        assert_eq!(
            detail_log_path(&base, "U1"),
            PathBuf::from("/proj/scenes/export/serve/log/detail/U1.json")
        );
        assert_eq!(
            user_log_path(&base, "alice"),
            PathBuf::from("/proj/scenes/export/serve/log/users/alice.json")
        );
    }

    #[test]
    fn normalize_dir_gives_aliases_one_spelling() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let plain = normalize_dir(dir.path());
        assert_eq!(normalize_dir(&dir.path().join("sub").join("..")), plain);
        assert_eq!(normalize_dir(&dir.path().join(".")), plain);
        assert_eq!(
            normalize_dir(Path::new("/no/such/root/a/../b")),
            PathBuf::from("/no/such/root/b")
        );
        assert!(normalize_dir(Path::new("relative/dir")).is_absolute());
    }

    #[test]
    fn bare_engine_file_name_uses_current_directory() {
        assert_eq!(base_dir(Path::new("room.hip")), PathBuf::from("."));
    }

    #[test]
    fn safe_filename_replaces_reserved_characters() {
        assert_eq!(safe_filename("a<b>c:d\"e/f\\g|h?i*j+k"), "a_b_c_d_e_f_g_h_i_j_k");
        assert_eq!(safe_filename("tab\there"), "tab_here");
        assert_eq!(safe_filename(".."), "_");
        assert_eq!(safe_filename("   "), "_");
    }

    #[test]
    fn safe_filename_truncates_long_ids() {
        let long = "x".repeat(500);
        assert_eq!(safe_filename(&long).len(), 200);
    }

    #[test]
    fn uuid_must_be_a_single_component() {
        assert!(is_safe_uuid("4f0c2a9e-room"));
        assert!(!is_safe_uuid(""));
        assert!(!is_safe_uuid("../escape"));
        assert!(!is_safe_uuid("a/b"));
        assert!(!is_safe_uuid("a\\b"));
        assert!(!is_safe_uuid("."));
    }
}
