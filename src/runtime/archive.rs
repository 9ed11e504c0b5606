// ABOUTME: Turns live-update path mappings into a tar stream and a delete list.
// ABOUTME: Entries are rooted at `/` so the archive extracts in place inside the container.

use std::path::Path;

use super::error::RuntimeError;
use crate::model::PathMapping;

/// Mappings split by whether the local file still exists.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchivePlan {
    pub to_archive: Vec<PathMapping>,
    pub to_delete: Vec<String>,
}

pub fn split_mappings(mappings: &[PathMapping]) -> ArchivePlan {
    let mut plan = ArchivePlan::default();
    for mapping in mappings {
        if mapping.local_path.exists() {
            plan.to_archive.push(mapping.clone());
        } else {
            plan.to_delete.push(mapping.container_path.clone());
        }
    }
    plan
}

/// Tar the given mappings. Directories are added recursively.
pub fn tar_mappings(mappings: &[PathMapping]) -> Result<Vec<u8>, RuntimeError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for mapping in mappings {
        let dest = Path::new(mapping.container_path.trim_start_matches('/'));
        let local = &mapping.local_path;
        let result = if local.is_dir() {
            builder.append_dir_all(dest, local)
        } else {
            builder.append_path_with_name(local, dest)
        };
        result.map_err(|source| RuntimeError::Archive { source })?;
    }

    builder
        .into_inner()
        .map_err(|source| RuntimeError::Archive { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::path::PathBuf;

    fn mapping(local: PathBuf, container: &str) -> PathMapping {
        PathMapping {
            local_path: local,
            container_path: container.to_string(),
        }
    }

    #[test]
    fn split_separates_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("main.go");
        fs::write(&present, "package main").unwrap();
        let gone = dir.path().join("old.go");

        let plan = split_mappings(&[
            mapping(present.clone(), "/app/main.go"),
            mapping(gone, "/app/old.go"),
        ]);
        assert_eq!(plan.to_archive, vec![mapping(present, "/app/main.go")]);
        assert_eq!(plan.to_delete, vec!["/app/old.go".to_string()]);
    }

    #[test]
    fn archive_places_files_at_container_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.html");
        fs::write(&file, "<h1>hi</h1>").unwrap();
        let sub = dir.path().join("static");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("app.css"), "body{}").unwrap();

        let bytes = tar_mappings(&[
            mapping(file, "/srv/www/index.html"),
            mapping(sub, "/srv/www/static"),
        ])
        .unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            if path == "srv/www/index.html" {
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                assert_eq!(body, "<h1>hi</h1>");
            }
            found.push(path);
        }
        assert!(found.contains(&"srv/www/index.html".to_string()));
        assert!(found.contains(&"srv/www/static/app.css".to_string()));
    }

    #[test]
    fn empty_mappings_make_empty_archive() {
        let bytes = tar_mappings(&[]).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        assert_eq!(archive.entries().unwrap().count(), 0);
    }
}
