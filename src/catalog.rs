//! Observation folders and image files on disk.
//!
//! Every observation owns `<images>/<genus>/<species> - <date>/`. Renaming a
//! taxon moves that folder, merging into an existing one when needed, and the
//! new image paths are written in the same transaction as the taxonomy.
//! File operations are best-effort: failures are logged and the rows keep
//! pointing at files that still exist.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use walkdir::WalkDir;

use crate::config::OriginalStorageMode;
use crate::db::{Database, DeletedFiles, ImagePaths};
use crate::error::{Error, Result};
use crate::model::{ImageRecord, NewImage, Observation, ObservationDraft};

/// Sub-folder of an observation holding full-resolution originals.
pub const ORIGINALS_SUBDIR: &str = "originals";

const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Make a string safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .chars()
        .map(|c| {
            if INVALID_PATH_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.trim_end_matches(['.', ' ']).to_string()
}

fn component_or(raw: Option<&str>, fallback: &str) -> String {
    let sanitized = raw.map(sanitize_component).unwrap_or_default();
    if sanitized.is_empty() {
        fallback.to_string()
    } else {
        sanitized
    }
}

/// Whether `path` lies inside `root`.
pub fn is_under(path: &Path, root: &Path) -> bool {
    !root.as_os_str().is_empty() && path.starts_with(root)
}

/// First of `path`, `stem_1.ext`, `stem_2.ext`, ... that does not exist.
pub fn uniquify_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    (1..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Move one file, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Where each file ended up after a folder move.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderMove {
    pub from: PathBuf,
    pub to: PathBuf,
    /// Files renamed to avoid collisions while merging.
    pub renamed: HashMap<PathBuf, PathBuf>,
}

impl FolderMove {
    /// New location of a path that used to be inside `from`.
    pub fn relocate(&self, path: &Path) -> PathBuf {
        if let Some(renamed) = self.renamed.get(path) {
            return renamed.clone();
        }
        match path.strip_prefix(&self.from) {
            Ok(relative) => self.to.join(relative),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Move `from` to `to`, merging file by file when `to` already exists.
///
/// A failed merge moves the files it already placed back to `from` before
/// returning the error. A source folder left behind after every file moved
/// is only logged.
pub fn move_folder(from: &Path, to: &Path) -> io::Result<FolderMove> {
    let mut moved = FolderMove {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        renamed: HashMap::new(),
    };
    if !to.exists() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(from, to).is_ok() {
            return Ok(moved);
        }
    }

    let files: Vec<PathBuf> = WalkDir::new(from)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    let mut done: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(files.len());
    for file in files {
        let Ok(relative) = file.strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        let dest = uniquify_path(&target);
        if let Err(e) = move_file(&file, &dest) {
            roll_back(&done);
            return Err(e);
        }
        if dest != target {
            log::debug!("Merged {:?} as {:?}", file, dest);
            moved.renamed.insert(file.clone(), dest.clone());
        }
        done.push((file, dest));
    }
    if let Err(e) = fs::remove_dir_all(from) {
        log::warn!("Could not remove emptied folder {:?}: {}", from, e);
    }
    Ok(moved)
}

/// Undo a partial merge, newest move first.
fn roll_back(done: &[(PathBuf, PathBuf)]) {
    for (original, dest) in done.iter().rev() {
        if let Err(e) = move_file(dest, original) {
            log::warn!("Could not move {:?} back to {:?}: {}", dest, original, e);
        }
    }
}

/// Remove `folder` and its sub-folders bottom-up as long as they are empty.
/// Returns whether `folder` itself is gone.
fn remove_empty_dirs(folder: &Path) -> bool {
    let dirs: Vec<PathBuf> = WalkDir::new(folder)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    for dir in dirs {
        if let Err(e) = fs::remove_dir(&dir) {
            log::trace!("Keeping {:?}: {}", dir, e);
        }
    }
    !folder.exists()
}

/// Produces resized previews for an image. Resampling is opaque to the store.
pub trait ThumbnailGenerator {
    /// Write previews of `source` into `out_dir`; returns `(preset, path)` pairs.
    fn generate(&self, source: &Path, image_id: i64, out_dir: &Path) -> Result<Vec<(String, PathBuf)>>;
}

/// Square-bounded previews written with the `image` crate.
#[derive(Debug, Clone)]
pub struct ResizeThumbnails {
    /// `(preset name, longest side in pixels)`.
    pub presets: Vec<(String, u32)>,
}

impl Default for ResizeThumbnails {
    fn default() -> Self {
        Self {
            presets: vec![("224".to_string(), 224), ("gallery".to_string(), 512)],
        }
    }
}

impl ThumbnailGenerator for ResizeThumbnails {
    fn generate(&self, source: &Path, image_id: i64, out_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let img = image::open(source)?;
        fs::create_dir_all(out_dir)?;
        let mut written = Vec::with_capacity(self.presets.len());
        for (preset, size) in &self.presets {
            let thumb = img.resize(*size, *size, FilterType::Triangle);
            let path = out_dir.join(format!("{}_{}.png", image_id, preset));
            thumb.save(&path)?;
            written.push((preset.clone(), path));
        }
        Ok(written)
    }
}

/// Files removed by a delete, after the rows were gone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemovedFiles {
    pub files: usize,
    pub folder: Option<PathBuf>,
}

/// Filesystem side of the observation/image lifecycle.
#[derive(Debug, Clone)]
pub struct Catalog {
    images_root: PathBuf,
    originals_root: PathBuf,
    thumbnails_root: PathBuf,
    storage_mode: OriginalStorageMode,
}

impl Catalog {
    pub fn new(
        images_root: impl Into<PathBuf>,
        originals_root: impl Into<PathBuf>,
        thumbnails_root: impl Into<PathBuf>,
        storage_mode: OriginalStorageMode,
    ) -> Self {
        Self {
            images_root: images_root.into(),
            originals_root: originals_root.into(),
            thumbnails_root: thumbnails_root.into(),
            storage_mode,
        }
    }

    pub fn images_root(&self) -> &Path {
        &self.images_root
    }

    pub fn thumbnails_root(&self) -> &Path {
        &self.thumbnails_root
    }

    pub fn storage_mode(&self) -> OriginalStorageMode {
        self.storage_mode
    }

    pub fn set_storage_mode(&mut self, mode: OriginalStorageMode) {
        self.storage_mode = mode;
    }

    /// `<images>/<genus>/<species> - <date>`, with placeholders for missing taxa.
    pub fn observation_folder(&self, genus: Option<&str>, species: Option<&str>, date: &str) -> PathBuf {
        let genus = component_or(genus, "Unknown");
        let species = component_or(species, "sp.");
        let date = sanitize_component(date);
        self.images_root
            .join(genus)
            .join(format!("{} - {}", species, date))
    }

    fn folder_for_draft(&self, draft: &ObservationDraft) -> PathBuf {
        self.observation_folder(draft.genus.as_deref(), draft.species.as_deref(), &draft.date)
    }

    /// Create the row and its folder.
    pub fn create_observation(&self, db: &Database, draft: &ObservationDraft) -> Result<i64> {
        let folder = self.folder_for_draft(draft);
        if let Err(e) = fs::create_dir_all(&folder) {
            log::warn!("Could not create observation folder {:?}: {}", folder, e);
        }
        let id = db.insert_observation(draft, Some(&folder))?;
        log::info!("Created observation {} in {:?}", id, folder);
        Ok(id)
    }

    /// Current folder of an observation, inferred from its images when unset.
    fn current_folder(&self, db: &Database, obs: &Observation) -> Result<Option<PathBuf>> {
        if obs.folder_path.is_some() {
            return Ok(obs.folder_path.clone());
        }
        let images = db.images_for_observation(obs.id)?;
        let mut parents = images
            .iter()
            .filter(|i| is_under(&i.filepath, &self.images_root))
            .filter_map(|i| i.filepath.parent().map(Path::to_path_buf));
        let first = parents.next();
        if parents.all(|p| Some(&p) == first.as_ref()) {
            Ok(first)
        } else {
            Ok(None)
        }
    }

    /// Save edited fields, moving the folder when taxonomy or date changed.
    ///
    /// Returns the folder the observation ends up in.
    pub fn update_observation(
        &self,
        db: &mut Database,
        id: i64,
        draft: &ObservationDraft,
    ) -> Result<PathBuf> {
        let obs = db.require_observation(id)?;
        let target = self.folder_for_draft(draft);
        let current = self.current_folder(db, &obs)?;

        let folder = match current {
            Some(current) if current == target => current,
            Some(current) if current.exists() => match move_folder(&current, &target) {
                Ok(moved) => {
                    log::info!("Moved observation {} folder {:?} -> {:?}", id, current, target);
                    let paths: Vec<ImagePaths> = db
                        .images_for_observation(id)?
                        .into_iter()
                        .map(|image| ImagePaths {
                            image_id: image.id,
                            filepath: moved.relocate(&image.filepath),
                            original_filepath: image
                                .original_filepath
                                .as_deref()
                                .map(|p| moved.relocate(p)),
                        })
                        .collect();
                    db.update_observation_with_paths(id, draft, Some(&target), &paths)?;
                    return Ok(target);
                }
                Err(e) => {
                    log::warn!(
                        "Could not move {:?} to {:?}, keeping old location: {}",
                        current,
                        target,
                        e
                    );
                    current
                }
            },
            _ => {
                if let Err(e) = fs::create_dir_all(&target) {
                    log::warn!("Could not create observation folder {:?}: {}", target, e);
                }
                target
            }
        };
        db.update_observation_with_paths(id, draft, Some(&folder), &[])?;
        Ok(folder)
    }

    /// Attach an image to an observation, copying files as requested.
    pub fn add_image(&self, db: &Database, observation_id: i64, new: &NewImage) -> Result<i64> {
        if !(new.resample_scale_factor > 0.0) {
            return Err(Error::invalid_input(format!(
                "resample factor must be positive, got {}",
                new.resample_scale_factor
            )));
        }
        if !new.source_path.exists() {
            return Err(Error::FileNotFound {
                path: new.source_path.clone(),
            });
        }
        let obs = db.require_observation(observation_id)?;
        let folder = match self.current_folder(db, &obs)? {
            Some(folder) => folder,
            None => self.observation_folder(obs.genus.as_deref(), obs.species.as_deref(), &obs.date),
        };

        let filepath = if new.copy_to_folder {
            let name = new
                .source_path
                .file_name()
                .ok_or_else(|| Error::invalid_input("image path has no file name"))?;
            fs::create_dir_all(&folder)?;
            let dest = uniquify_path(&folder.join(name));
            fs::copy(&new.source_path, &dest)?;
            log::debug!("Copied {:?} to {:?}", new.source_path, dest);
            dest
        } else {
            new.source_path.clone()
        };

        let original_filepath = match &new.original_path {
            Some(original) => self.store_original(original, &folder)?,
            None => None,
        };

        let record = ImageRecord {
            observation_id: Some(observation_id),
            original_filepath,
            micro_category: new.micro_category.clone(),
            objective_name: new.objective_name.clone(),
            scale_microns_per_pixel: new.scale_microns_per_pixel,
            calibration_id: new.calibration_id,
            mount_medium: new.mount_medium.clone(),
            sample_type: new.sample_type.clone(),
            contrast: new.contrast.clone(),
            measure_color: new.measure_color.clone(),
            notes: new.notes.clone(),
            gps_source: new.gps_source,
            resample_scale_factor: new.resample_scale_factor,
            ..ImageRecord::new(filepath, new.image_type)
        };
        db.insert_image(&record)
    }

    /// Copy a full-resolution original according to the storage mode.
    ///
    /// Nothing is kept in [`OriginalStorageMode::None`].
    fn store_original(&self, original: &Path, folder: &Path) -> Result<Option<PathBuf>> {
        let dir = match self.storage_mode {
            OriginalStorageMode::None => return Ok(None),
            OriginalStorageMode::Observation => folder.join(ORIGINALS_SUBDIR),
            OriginalStorageMode::Global => match folder.strip_prefix(&self.images_root) {
                Ok(relative) => self.originals_root.join(relative),
                Err(_) => self.originals_root.clone(),
            },
        };
        let Some(name) = original.file_name() else {
            return Err(Error::invalid_input("original path has no file name"));
        };
        fs::create_dir_all(&dir)?;
        let dest = uniquify_path(&dir.join(name));
        fs::copy(original, &dest)?;
        Ok(Some(dest))
    }

    /// Generate previews for an image and record them.
    pub fn generate_thumbnails(
        &self,
        db: &Database,
        generator: &dyn ThumbnailGenerator,
        image_id: i64,
    ) -> Result<usize> {
        let image = db.require_image(image_id)?;
        let written = generator.generate(&image.filepath, image_id, &self.thumbnails_root)?;
        for (preset, path) in &written {
            db.add_thumbnail(image_id, preset, path)?;
        }
        Ok(written.len())
    }

    fn owns(&self, path: &Path) -> bool {
        is_under(path, &self.images_root)
            || is_under(path, &self.originals_root)
            || is_under(path, &self.thumbnails_root)
    }

    fn remove_owned(&self, files: &DeletedFiles) -> usize {
        files
            .images
            .iter()
            .chain(files.thumbnails.iter())
            .filter(|path| self.owns(path))
            .filter(|path| match fs::remove_file(path) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => {
                    log::warn!("Could not remove {:?}: {}", path, e);
                    false
                }
            })
            .count()
    }

    /// Delete an observation with everything it owns, then its files.
    pub fn delete_observation(&self, db: &mut Database, id: i64) -> Result<RemovedFiles> {
        let obs = db.require_observation(id)?;
        let folder = self.current_folder(db, &obs)?;
        let deleted = db.delete_observation_cascade(id)?;
        let mut removed = RemovedFiles {
            files: self.remove_owned(&deleted),
            folder: None,
        };
        if let Some(folder) = folder.filter(|f| is_under(f, &self.images_root) && f.exists()) {
            let shared = db
                .list_observations()?
                .iter()
                .any(|o| o.folder_path.as_deref() == Some(folder.as_path()));
            if shared {
                log::debug!("Keeping folder {:?}, another observation uses it", folder);
            } else if remove_empty_dirs(&folder) {
                removed.folder = Some(folder);
            } else {
                log::info!("Folder {:?} still holds other files, keeping it", folder);
            }
        }
        log::info!("Deleted observation {} ({} files)", id, removed.files);
        Ok(removed)
    }

    /// Delete one image row with its dependents, then its files.
    pub fn delete_image(&self, db: &mut Database, id: i64) -> Result<RemovedFiles> {
        let deleted = db.delete_image_cascade(id)?;
        Ok(RemovedFiles {
            files: self.remove_owned(&deleted),
            folder: None,
        })
    }
}
