use crate::constants::backup;
use crate::task::ArchiveFormat;
use crate::{AgentError, Result};
use chrono::{DateTime, Local, TimeZone};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::Builder;
use walkdir::WalkDir;

/// 归档结果
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub name: String,
    /// 遍历时写入内容的普通文件数量，不含符号链接
    pub files_count: usize,
}

/// 归档生成器
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    output_dir: PathBuf,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(backup::get_archive_dir())
    }
}

/// 生成归档文件名: {主机标识}_{源路径}_{时间戳}.{格式}
pub fn archive_name<Tz: TimeZone>(
    seed: &str,
    source_path: &str,
    format: ArchiveFormat,
    now: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let safe_path = source_path.trim_start_matches('/').replace('/', "_");
    format!(
        "{}_{}_{}.{}",
        seed,
        safe_path,
        now.format(backup::TIMESTAMP_FORMAT),
        format.extension()
    )
}

/// 统计目录下普通文件数量，遍历错误被忽略
pub fn count_files(path: &Path) -> usize {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

impl ArchiveBuilder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// 以当前本地时间命名并创建归档
    pub async fn build(
        &self,
        source_path: &str,
        format: ArchiveFormat,
        seed: &str,
    ) -> Result<BuiltArchive> {
        let name = archive_name(seed, source_path, format, &Local::now());
        self.build_as(source_path, format, name).await
    }

    /// 以指定名称在输出目录下创建归档
    ///
    /// 失败时已写入的部分文件保留在磁盘上，由调用方决定是否清理。
    pub async fn build_as(
        &self,
        source_path: &str,
        format: ArchiveFormat,
        name: String,
    ) -> Result<BuiltArchive> {
        let path = self.archive_path(&name);

        tracing::info!(archive = %path.display(), source = source_path, "开始创建归档");

        tokio::fs::create_dir_all(&self.output_dir).await?;

        let source = PathBuf::from(source_path);
        let output = path.clone();
        let files_count =
            tokio::task::spawn_blocking(move || write_archive(&source, &output, format))
                .await??;

        tracing::info!(archive = %path.display(), files_count, "归档创建成功");

        Ok(BuiltArchive {
            path,
            name,
            files_count,
        })
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }
}

fn write_archive(source: &Path, output: &Path, format: ArchiveFormat) -> Result<usize> {
    let file = File::create(output)?;

    if format.is_compressed() {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut archive = Builder::new(encoder);
        let count = append_tree(&mut archive, source)?;
        let encoder = archive
            .into_inner()
            .map_err(|e| AgentError::archive(format!("完成归档失败: {e}")))?;
        encoder.finish()?.sync_all()?;
        Ok(count)
    } else {
        let mut archive = Builder::new(file);
        let count = append_tree(&mut archive, source)?;
        let mut file = archive
            .into_inner()
            .map_err(|e| AgentError::archive(format!("完成归档失败: {e}")))?;
        file.flush()?;
        file.sync_all()?;
        Ok(count)
    }
}

/// 深度优先遍历源目录，每个路径写入一个条目，只有普通文件携带内容
fn append_tree<W: Write>(archive: &mut Builder<W>, source: &Path) -> Result<usize> {
    if !source.is_dir() {
        return Err(AgentError::archive(format!(
            "源目录不存在: {}",
            source.display()
        )));
    }
    archive.follow_symlinks(false);

    let mut files_count = 0;
    // 根目录本身没有相对路径，不单独写入条目
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| AgentError::archive(format!("遍历目录失败: {e}")))?;
        let path = entry.path();
        let relative_path = path.strip_prefix(source)?;

        // tar 内部统一使用 Unix 风格路径
        let archive_path = if cfg!(windows) {
            relative_path.display().to_string().replace('\\', "/")
        } else {
            relative_path.display().to_string()
        };

        archive
            .append_path_with_name(path, &archive_path)
            .map_err(|e| {
                AgentError::archive(format!("添加 {} 到归档失败: {e}", path.display()))
            })?;

        if entry.file_type().is_file() {
            files_count += 1;
        }
    }

    Ok(files_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tar::Archive;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("nested/b.txt"), b"bravo").unwrap();
        std::fs::write(root.join("nested/deeper/c.bin"), [0u8, 1, 2, 3]).unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("a.txt", root.join("link.txt")).unwrap();
            std::os::unix::fs::symlink("nested", root.join("linked_dir")).unwrap();
        }
    }

    fn read_regular_files<R: Read>(reader: R) -> BTreeMap<String, Vec<u8>> {
        let mut archive = Archive::new(reader);
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                let name = entry.path().unwrap().display().to_string();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                files.insert(name, content);
            }
        }
        files
    }

    #[test]
    fn test_archive_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            archive_name("10.0.0.5", "/var/lib/app", ArchiveFormat::TarGz, &now),
            "10.0.0.5_var_lib_app_20240309_140507.tar.gz"
        );
        assert_eq!(
            archive_name("unknown", "data", ArchiveFormat::Tar, &now),
            "unknown_data_20240309_140507.tar"
        );
    }

    #[test]
    fn test_archive_name_changes_each_second() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let first = archive_name("h", "/data", ArchiveFormat::TarGz, &now);
        let again = archive_name("h", "/data", ArchiveFormat::TarGz, &now);
        let later = archive_name(
            "h",
            "/data",
            ArchiveFormat::TarGz,
            &(now + Duration::seconds(1)),
        );
        assert_eq!(first, again);
        assert_ne!(first, later);
    }

    #[test]
    fn test_count_files() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        assert_eq!(count_files(dir.path()), 3);
        assert_eq!(count_files(&dir.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn test_build_tar_gz_contains_every_regular_file() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        populate(source.path());

        let builder = ArchiveBuilder::new(output.path());
        let source_str = source.path().to_string_lossy().to_string();
        let built = builder
            .build(&source_str, ArchiveFormat::TarGz, "host")
            .await
            .unwrap();

        assert!(built.name.starts_with("host_"));
        assert!(built.name.ends_with(".tar.gz"));
        assert_eq!(built.path, output.path().join(&built.name));
        assert_eq!(built.files_count, 3);

        let file = File::open(&built.path).unwrap();
        let files = read_regular_files(GzDecoder::new(file));
        let names: Vec<_> = files.keys().cloned().collect();
        assert_eq!(names, vec!["a.txt", "nested/b.txt", "nested/deeper/c.bin"]);
        assert_eq!(files["nested/b.txt"], b"bravo");
        assert_eq!(files["nested/deeper/c.bin"], vec![0u8, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_build_plain_tar_keeps_directories() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        populate(source.path());

        let builder = ArchiveBuilder::new(output.path());
        let built = builder
            .build(&source.path().to_string_lossy(), ArchiveFormat::Tar, "host")
            .await
            .unwrap();

        let mut archive = Archive::new(File::open(&built.path).unwrap());
        let mut dirs = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.header().entry_type().is_dir() {
                dirs.push(
                    entry
                        .path()
                        .unwrap()
                        .display()
                        .to_string()
                        .trim_end_matches('/')
                        .to_string(),
                );
            }
        }
        dirs.sort();
        assert_eq!(dirs, vec!["empty", "nested", "nested/deeper"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_stored_as_links() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        populate(source.path());

        let builder = ArchiveBuilder::new(output.path());
        let built = builder
            .build(&source.path().to_string_lossy(), ArchiveFormat::Tar, "host")
            .await
            .unwrap();
        assert_eq!(built.files_count, 3);

        let mut archive = Archive::new(File::open(&built.path).unwrap());
        let mut links = BTreeMap::new();
        let mut paths = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            if entry.header().entry_type() == tar::EntryType::Symlink {
                let target = entry.link_name().unwrap().unwrap().display().to_string();
                links.insert(path.clone(), target);
            }
            paths.push(path);
        }

        assert_eq!(links.len(), 2);
        assert_eq!(links["link.txt"], "a.txt");
        assert_eq!(links["linked_dir"], "nested");
        assert!(!paths.iter().any(|p| p.starts_with("linked_dir/")));
        assert_eq!(count_files(source.path()), 3);
    }

    #[tokio::test]
    async fn test_build_missing_source_fails() {
        let output = tempdir().unwrap();
        let builder = ArchiveBuilder::new(output.path());

        let result = builder
            .build("/definitely/not/here", ArchiveFormat::TarGz, "host")
            .await;
        assert!(matches!(result, Err(AgentError::Archive(_))));
    }
}
