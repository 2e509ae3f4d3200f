//! Image file lifecycle: create, delete, rename, copy and protect image
//! files in the default image folder

use std::path::{Path, PathBuf};

use super::context::CommandContext;
use super::proto::{PbCommand, PbDeviceType, PbImageFile, PbOperation};
use crate::daemon::ReservationTable;
use crate::scsi::target::factory;

/// Smallest usable image: one 512-byte sector
const MIN_IMAGE_SIZE: u64 = 512;

pub struct ImageStore {
    default_folder: PathBuf,
    depth: usize,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            default_folder: home_dir().join("images"),
            depth: 1,
        }
    }

    pub fn default_folder(&self) -> &Path {
        &self.default_folder
    }

    #[cfg(test)]
    pub fn set_default_folder_unchecked(&mut self, folder: PathBuf) {
        self.default_folder = folder;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Sets the default image folder. Relative paths are resolved against
    /// the (sudo-aware) home directory; absolute paths must be located in
    /// /home/.
    pub fn set_default_folder(&mut self, folder: &str) -> Result<(), String> {
        if folder.is_empty() {
            return Err("Can't set default image folder: Missing folder name".to_string());
        }

        let path = if folder.starts_with('/') {
            if !folder.starts_with("/home/") {
                return Err("Default image folder must be located in '/home/'".to_string());
            }
            PathBuf::from(folder)
        } else {
            home_dir().join(folder)
        };

        // Resolve a potential symlink
        let path = std::fs::read_link(&path).unwrap_or(path);

        if !path.is_dir() {
            return Err(format!("'{}' is not a valid folder", path.display()));
        }

        log::info!("Default image folder set to '{}'", path.display());
        self.default_folder = path;

        Ok(())
    }

    /// Limits the folder hierarchy depth of a file name
    fn check_depth(&self, filename: &str) -> bool {
        filename.matches('/').count() <= self.depth
    }

    fn full_name(&self, filename: &str) -> PathBuf {
        self.default_folder.join(filename)
    }

    /// Resolves a file name against the default folder when the literal
    /// path does not exist
    pub fn resolve_existing(&self, filename: &str) -> PathBuf {
        let literal = PathBuf::from(filename);
        if literal.exists() {
            literal
        } else {
            self.full_name(filename)
        }
    }

    pub fn create_image(&self, context: &mut CommandContext, command: &PbCommand) -> bool {
        let filename = command.param("file");
        if filename.is_empty() {
            return context.return_status(false, "Can't create image file: Missing image filename");
        }

        if !self.check_depth(&filename) {
            return context
                .return_status(false, &format!("Invalid folder hierarchy depth '{}'", filename));
        }

        let full_path = self.full_name(&filename);
        if full_path.exists() {
            return context.return_status(
                false,
                &format!(
                    "Can't create image file: '{}': File already exists",
                    full_path.display()
                ),
            );
        }

        let size = command.param("size");
        if size.is_empty() {
            return context.return_status(
                false,
                &format!(
                    "Can't create image file '{}': Missing file size",
                    full_path.display()
                ),
            );
        }

        let len: u64 = match size.parse() {
            Ok(len) => len,
            Err(_) => {
                return context.return_status(
                    false,
                    &format!(
                        "Can't create image file '{}': Invalid file size {}",
                        full_path.display(),
                        size
                    ),
                );
            }
        };
        if len < MIN_IMAGE_SIZE || len % 512 != 0 {
            return context.return_status(
                false,
                &format!("Invalid image file size {} (not a multiple of 512)", len),
            );
        }

        if let Err(msg) = self.create_image_folder(&full_path) {
            return context.return_status(false, &msg);
        }

        let read_only = command.param("read_only") == "true";

        let create = || -> std::io::Result<()> {
            let file = std::fs::File::create(&full_path)?;
            file.set_len(len)?;
            Ok(())
        };
        if let Err(e) = create() {
            let _ = std::fs::remove_file(&full_path);
            return context.return_status(
                false,
                &format!("Can't create image file '{}': {}", full_path.display(), e),
            );
        }

        if let Err(msg) = change_owner(&full_path, read_only) {
            let _ = std::fs::remove_file(&full_path);
            return context.return_status(false, &msg);
        }

        log::info!(
            "Created {}image file '{}' with a size of {} bytes",
            if read_only { "read-only " } else { "" },
            full_path.display(),
            len
        );

        context.return_ok()
    }

    pub fn delete_image(
        &self,
        context: &mut CommandContext,
        command: &PbCommand,
        reservations: &ReservationTable,
    ) -> bool {
        let filename = command.param("file");
        if filename.is_empty() {
            return context.return_status(false, "Missing image filename");
        }

        if !self.check_depth(&filename) {
            return context
                .return_status(false, &format!("Invalid folder hierarchy depth '{}'", filename));
        }

        let full_path = self.full_name(&filename);
        if !full_path.exists() {
            return context.return_status(
                false,
                &format!("Image file '{}' does not exist", full_path.display()),
            );
        }

        if let Some((id, lun)) = reservations.owner(&full_path) {
            return context.return_status(
                false,
                &format!(
                    "Can't delete image file '{}', it is currently being used by device ID {}, LUN {}",
                    full_path.display(),
                    id,
                    lun
                ),
            );
        }

        if std::fs::remove_file(&full_path).is_err() {
            return context.return_status(
                false,
                &format!("Can't delete image file '{}'", full_path.display()),
            );
        }

        // Delete now-empty subfolders, stopping at the default folder
        let mut parent = filename.rsplit_once('/').map(|(dir, _)| dir.to_string());
        while let Some(folder) = parent {
            let full_folder = self.full_name(&folder);
            let is_empty = std::fs::read_dir(&full_folder)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                break;
            }

            if std::fs::remove_dir(&full_folder).is_err() {
                return context.return_status(
                    false,
                    &format!(
                        "Can't delete empty image folder '{}'",
                        full_folder.display()
                    ),
                );
            }

            parent = folder.rsplit_once('/').map(|(dir, _)| dir.to_string());
        }

        log::info!("Deleted image file '{}'", full_path.display());

        context.return_ok()
    }

    pub fn rename_image(
        &self,
        context: &mut CommandContext,
        command: &PbCommand,
        reservations: &ReservationTable,
    ) -> bool {
        let Some((from, to)) = self.validate_from_to(context, command, "rename/move") else {
            return false;
        };

        if reservations.is_reserved(&from) {
            return context.return_status(
                false,
                &format!("Can't rename/move image file '{}': File in use", from.display()),
            );
        }

        if let Err(msg) = self.create_image_folder(&to) {
            return context.return_status(false, &msg);
        }

        if let Err(e) = std::fs::rename(&from, &to) {
            return context.return_status(
                false,
                &format!(
                    "Can't rename/move image file '{}' to '{}': {}",
                    from.display(),
                    to.display(),
                    e
                ),
            );
        }

        log::info!(
            "Renamed/Moved image file '{}' to '{}'",
            from.display(),
            to.display()
        );

        context.return_ok()
    }

    pub fn copy_image(&self, context: &mut CommandContext, command: &PbCommand) -> bool {
        let Some((from, to)) = self.validate_from_to(context, command, "copy") else {
            return false;
        };

        if let Err(msg) = self.create_image_folder(&to) {
            return context.return_status(false, &msg);
        }

        // Symbolic links are copied as links, not as their target
        if from.is_symlink() {
            let result = std::fs::read_link(&from)
                .and_then(|target| std::os::unix::fs::symlink(target, &to));
            if let Err(e) = result {
                return context.return_status(
                    false,
                    &format!("Can't copy image file symlink '{}': {}", from.display(), e),
                );
            }

            log::info!(
                "Copied image file symlink '{}' to '{}'",
                from.display(),
                to.display()
            );
            return context.return_ok();
        }

        if let Err(e) = std::fs::copy(&from, &to) {
            return context.return_status(
                false,
                &format!(
                    "Can't copy image file '{}' to '{}': {}",
                    from.display(),
                    to.display(),
                    e
                ),
            );
        }

        if let Err(msg) = set_permissions(&to, command.param("read_only") == "true") {
            return context.return_status(false, &msg);
        }

        log::info!(
            "Copied image file '{}' to '{}'",
            from.display(),
            to.display()
        );

        context.return_ok()
    }

    pub fn set_image_permissions(
        &self,
        context: &mut CommandContext,
        command: &PbCommand,
    ) -> bool {
        let filename = command.param("file");
        if filename.is_empty() {
            return context.return_status(false, "Missing image filename");
        }

        if !self.check_depth(&filename) {
            return context
                .return_status(false, &format!("Invalid folder hierarchy depth '{}'", filename));
        }

        let full_path = self.full_name(&filename);
        if !is_valid_source(&full_path) {
            return context.return_status(
                false,
                &format!(
                    "Can't modify image file '{}': Invalid name or type",
                    full_path.display()
                ),
            );
        }

        let protect = command.operation_checked() == Some(PbOperation::ProtectImage);

        if let Err(msg) = set_permissions(&full_path, protect) {
            return context.return_status(
                false,
                &format!(
                    "Can't {} image file '{}': {}",
                    if protect { "protect" } else { "unprotect" },
                    full_path.display(),
                    msg
                ),
            );
        }

        if protect {
            log::info!("Protected image file '{}'", full_path.display());
        } else {
            log::info!("Unprotected image file '{}'", full_path.display());
        }

        context.return_ok()
    }

    /// Validates the `from`/`to` parameter pair of RENAME/COPY
    fn validate_from_to(
        &self,
        context: &mut CommandContext,
        command: &PbCommand,
        operation: &str,
    ) -> Option<(PathBuf, PathBuf)> {
        let from = command.param("from");
        if from.is_empty() {
            context.return_status(
                false,
                &format!("Can't {} image file: Missing source filename", operation),
            );
            return None;
        }

        if !self.check_depth(&from) {
            context.return_status(false, &format!("Invalid folder hierarchy depth '{}'", from));
            return None;
        }

        let from = self.full_name(&from);
        if !is_valid_source(&from) {
            context.return_status(
                false,
                &format!(
                    "Can't {} image file: '{}': Invalid name or type",
                    operation,
                    from.display()
                ),
            );
            return None;
        }

        let to = command.param("to");
        if to.is_empty() {
            context.return_status(
                false,
                &format!(
                    "Can't {} image file '{}': Missing destination filename",
                    operation,
                    from.display()
                ),
            );
            return None;
        }

        if !self.check_depth(&to) {
            context.return_status(false, &format!("Invalid folder hierarchy depth '{}'", to));
            return None;
        }

        let to = self.full_name(&to);
        if to.exists() {
            context.return_status(
                false,
                &format!(
                    "Can't {} image file '{}' to '{}': File already exists",
                    operation,
                    from.display(),
                    to.display()
                ),
            );
            return None;
        }

        Some((from, to))
    }

    /// Creates missing parent folders, owned by the effective user
    fn create_image_folder(&self, file_path: &Path) -> Result<(), String> {
        let Some(folder) = file_path.parent() else {
            return Ok(());
        };

        // Checking for existence first prevents an error when the top-level
        // folder is a softlink
        if folder.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(folder).map_err(|e| {
            format!("Can't create image folder '{}': {}", folder.display(), e)
        })?;

        change_owner_only(folder)
    }

    /// Protobuf description of a single image file
    pub fn image_file_info(&self, filename: &str) -> Option<PbImageFile> {
        let full_path = self.resolve_existing(filename);
        let metadata = std::fs::metadata(&full_path).ok()?;
        if !metadata.is_file() {
            return None;
        }

        let device_type = factory::device_type_for_file(filename)
            .map_or(PbDeviceType::Undefined, super::proto::types::from_core);

        Some(PbImageFile {
            name: filename.to_string(),
            read_only: metadata.permissions().readonly(),
            r#type: device_type as i32,
            size: metadata.len(),
        })
    }

    /// All image files in the default folder, up to the configured depth
    pub fn available_images(&self) -> Vec<PbImageFile> {
        let mut images = Vec::new();
        self.scan_folder(&self.default_folder.clone(), "", 0, &mut images);
        images.sort_by(|a, b| a.name.cmp(&b.name));
        images
    }

    fn scan_folder(&self, folder: &Path, prefix: &str, depth: usize, images: &mut Vec<PbImageFile>) {
        if depth > self.depth {
            return;
        }

        let Ok(entries) = std::fs::read_dir(folder) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };

            let path = entry.path();
            if path.is_dir() {
                self.scan_folder(&path, &relative, depth + 1, images);
            } else if let Some(info) = self.image_file_info(&relative) {
                images.push(info);
            }
        }
    }
}

fn is_valid_source(path: &Path) -> bool {
    // Must exist and be a regular file or a symlink
    path.is_file() || path.is_symlink()
}

/// The effective user: SUDO_UID when the daemon was started via sudo, the
/// real UID otherwise
#[cfg(unix)]
fn effective_uid_gid() -> (u32, Option<u32>) {
    let uid = std::env::var("SUDO_UID")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| nix::unistd::getuid().as_raw());

    let gid = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.gid.as_raw());

    (uid, gid)
}

#[cfg(unix)]
fn home_dir() -> PathBuf {
    let (uid, _) = effective_uid_gid();

    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map_or_else(|| PathBuf::from("/home/pi"), |user| user.dir)
}

#[cfg(not(unix))]
fn home_dir() -> PathBuf {
    PathBuf::from(".")
}

#[cfg(unix)]
fn change_owner_only(path: &Path) -> Result<(), String> {
    let (uid, gid) = effective_uid_gid();

    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        gid.map(nix::unistd::Gid::from_raw),
    )
    .map_err(|e| format!("Can't change ownership of '{}': {}", path.display(), e))
}

#[cfg(not(unix))]
fn change_owner_only(_path: &Path) -> Result<(), String> {
    Ok(())
}

fn change_owner(path: &Path, read_only: bool) -> Result<(), String> {
    change_owner_only(path)?;
    set_permissions(path, read_only)
}

#[cfg(unix)]
fn set_permissions(path: &Path, read_only: bool) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if read_only { 0o444 } else { 0o664 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| format!("Can't set permissions of '{}': {}", path.display(), e))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _read_only: bool) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::context::CaptureSink;
    use crate::control::locale::Localizer;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn store_in(dir: &Path) -> ImageStore {
        let mut store = ImageStore::new();
        store.default_folder = dir.to_path_buf();
        store
    }

    fn command_with_params(operation: PbOperation, params: &[(&str, &str)]) -> PbCommand {
        let mut command = PbCommand::new(operation);
        command.params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        command
    }

    fn run<F: FnOnce(&mut CommandContext) -> bool>(f: F) -> (bool, Vec<super::super::proto::PbResult>) {
        let mut sink = CaptureSink::default();
        let mut context = CommandContext::new(&mut sink, Arc::new(Localizer::new()), "en");
        let status = f(&mut context);
        (status, sink.results)
    }

    #[test]
    fn create_image_size_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        for (size, expected) in [("511", false), ("512", true), ("513", false), ("1024", true)] {
            let command = command_with_params(
                PbOperation::CreateImage,
                &[("file", &format!("test{}.hds", size)), ("size", size)],
            );
            let (status, _) = run(|context| store.create_image(context, &command));
            assert_eq!(status, expected, "size {}", size);
        }

        assert!(dir.path().join("test512.hds").exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("test1024.hds")).unwrap().len(),
            1024
        );
    }

    #[test]
    fn create_image_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let command = command_with_params(
            PbOperation::CreateImage,
            &[("file", "new.hds"), ("size", "1048576")],
        );
        let (status, _) = run(|context| store.create_image(context, &command));
        assert!(status);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("new.hds"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o664);
        }

        let (status, results) = run(|context| store.create_image(context, &command));
        assert!(!status);
        assert!(results[0].msg.contains("File already exists"));
    }

    #[test]
    fn create_image_honors_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let command = command_with_params(
            PbOperation::CreateImage,
            &[("file", "a/b/deep.hds"), ("size", "512")],
        );
        let (status, _) = run(|context| store.create_image(context, &command));
        assert!(!status);

        let command = command_with_params(
            PbOperation::CreateImage,
            &[("file", "a/flat.hds"), ("size", "512")],
        );
        let (status, _) = run(|context| store.create_image(context, &command));
        assert!(status);
    }

    #[test]
    fn delete_reserved_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(dir.path().join("used.hds"), vec![0u8; 512]).unwrap();

        let mut reservations = ReservationTable::default();
        reservations.reserve(&dir.path().join("used.hds"), 2, 0);

        let command = command_with_params(PbOperation::DeleteImage, &[("file", "used.hds")]);
        let (status, results) = run(|context| store.delete_image(context, &command, &reservations));
        assert!(!status);
        assert!(results[0].msg.contains("currently being used"));
        assert!(dir.path().join("used.hds").exists());
    }

    #[test]
    fn delete_removes_empty_parent_folders() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/only.hds"), vec![0u8; 512]).unwrap();

        let reservations = ReservationTable::default();
        let command = command_with_params(PbOperation::DeleteImage, &[("file", "sub/only.hds")]);
        let (status, _) = run(|context| store.delete_image(context, &command, &reservations));
        assert!(status);
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn rename_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(dir.path().join("src.hds"), vec![0u8; 512]).unwrap();

        let reservations = ReservationTable::default();
        let command = command_with_params(
            PbOperation::RenameImage,
            &[("from", "src.hds"), ("to", "dst.hds")],
        );
        let (status, _) = run(|context| store.rename_image(context, &command, &reservations));
        assert!(status);
        assert!(!dir.path().join("src.hds").exists());
        assert!(dir.path().join("dst.hds").exists());

        let command = command_with_params(
            PbOperation::CopyImage,
            &[("from", "dst.hds"), ("to", "copy.hds")],
        );
        let (status, _) = run(|context| store.copy_image(context, &command));
        assert!(status);
        assert!(dir.path().join("dst.hds").exists());
        assert!(dir.path().join("copy.hds").exists());

        // Destination must not exist
        let (status, _) = run(|context| store.copy_image(context, &command));
        assert!(!status);
    }

    #[test]
    fn protect_toggles_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(dir.path().join("img.hds"), vec![0u8; 512]).unwrap();

        let command = command_with_params(PbOperation::ProtectImage, &[("file", "img.hds")]);
        let (status, _) = run(|context| store.set_image_permissions(context, &command));
        assert!(status);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("img.hds"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o444);
        }

        let command = command_with_params(PbOperation::UnprotectImage, &[("file", "img.hds")]);
        let (status, _) = run(|context| store.set_image_permissions(context, &command));
        assert!(status);
    }

    #[test]
    fn available_images_respects_depth() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(dir.path().join("a.hds"), vec![0u8; 512]).unwrap();
        std::fs::create_dir_all(dir.path().join("x/y")).unwrap();
        std::fs::write(dir.path().join("x/b.iso"), vec![0u8; 512]).unwrap();
        std::fs::write(dir.path().join("x/y/c.hds"), vec![0u8; 512]).unwrap();

        let names: Vec<String> = store
            .available_images()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a.hds".to_string(), "x/b.iso".to_string()]);
    }
}
