use std::io::Cursor;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PipelineError, Result};

fn archive_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::SourceUpload(format!("failed to repackage source archive: {e}"))
}

/// Re-root a GitHub zipball so its contents sit at the archive root.
///
/// GitHub wraps everything in `{owner}-{repo}-{sha}/`. Each entry loses its
/// first path segment; the bare root entry and entries outside any directory
/// are dropped. Directory entries stay directories and unix permission bits
/// are carried over.
pub fn strip_top_level_dir(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(archive_error)?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len())));

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(archive_error)?;
        let name = entry.name().to_string();
        let Some((_, rest)) = name.split_once('/') else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }

        let mut options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if let Some(mode) = entry.unix_mode() {
            options = options.unix_permissions(mode);
        }

        if entry.is_dir() {
            writer.add_directory(rest, options).map_err(archive_error)?;
        } else {
            writer.start_file(rest, options).map_err(archive_error)?;
            std::io::copy(&mut entry, &mut writer).map_err(archive_error)?;
        }
    }

    Ok(writer.finish().map_err(archive_error)?.into_inner())
}

/// Zip fixture builder shared by tests in this crate.
#[cfg(test)]
pub(crate) fn fixture_archive(entries: &[(&str, Option<&str>, u32)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body, mode) in entries {
        let options = SimpleFileOptions::default().unix_permissions(*mode);
        match body {
            Some(body) => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            None => writer.add_directory(*name, options).unwrap(),
        }
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn names(bytes: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(ToString::to_string).collect()
    }

    #[test]
    fn removes_wrapper_directory() {
        let input = fixture_archive(&[
            ("owner-repo-abc123/", None, 0o755),
            ("owner-repo-abc123/Dockerfile", Some("FROM scratch\n"), 0o644),
            ("owner-repo-abc123/src/", None, 0o755),
            ("owner-repo-abc123/src/main.rs", Some("fn main() {}\n"), 0o644),
        ]);

        let output = strip_top_level_dir(&input).unwrap();
        let mut entries = names(&output);
        entries.sort();
        assert_eq!(entries, vec!["Dockerfile", "src/", "src/main.rs"]);

        let mut archive = ZipArchive::new(Cursor::new(output.as_slice())).unwrap();
        let mut dockerfile = String::new();
        archive
            .by_name("Dockerfile")
            .unwrap()
            .read_to_string(&mut dockerfile)
            .unwrap();
        assert_eq!(dockerfile, "FROM scratch\n");
        assert!(archive.by_name("src/").unwrap().is_dir());
    }

    #[test]
    fn drops_entries_outside_the_wrapper() {
        let input = fixture_archive(&[
            ("pax_global_header", Some("52 comment=abc\n"), 0o644),
            ("owner-repo-abc123/", None, 0o755),
            ("owner-repo-abc123/app.py", Some("print()\n"), 0o644),
        ]);

        let output = strip_top_level_dir(&input).unwrap();
        assert_eq!(names(&output), vec!["app.py"]);
    }

    #[test]
    fn keeps_executable_bits() {
        let input = fixture_archive(&[(
            "owner-repo-abc123/entrypoint.sh",
            Some("#!/bin/sh\n"),
            0o755,
        )]);

        let output = strip_top_level_dir(&input).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(output.as_slice())).unwrap();
        let mode = archive.by_name("entrypoint.sh").unwrap().unix_mode().unwrap();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn rejects_non_zip_input() {
        let err = strip_top_level_dir(b"<html>not a zip</html>").unwrap_err();
        assert_eq!(err.kind(), "SOURCE_UPLOAD_FAILED");
    }
}
