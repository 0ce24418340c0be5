//! Known-person registry: the one place the gallery is mutated.
//!
//! Every add or remove updates the store and the in-memory gallery together,
//! or neither.

use crate::store::{Store, StoreError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use vigil_core::{AnalyzerError, FaceAnalyzer, Gallery, GalleryError, IdentityLabel, KnownPerson};

pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;
pub type SharedGallery = Arc<RwLock<Gallery>>;

pub fn share_analyzer(analyzer: Box<dyn FaceAnalyzer>) -> SharedAnalyzer {
    Arc::new(Mutex::new(analyzer))
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("'{0}' is not a usable name")]
    InvalidName(String),
    #[error("'{0}' is already registered")]
    Duplicate(String),
    #[error("'{0}' is not registered")]
    NotFound(String),
    #[error("{} already exists in the known faces directory", .0.display())]
    ImageExists(PathBuf),
    #[error("cannot read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("no face found in image")]
    NoFace,
    #[error("image must contain exactly one face, found {0}")]
    MultipleFaces(usize),
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GalleryError> for RegistryError {
    fn from(e: GalleryError) -> Self {
        match e {
            GalleryError::Duplicate(name) => RegistryError::Duplicate(name),
            GalleryError::EmptyName => RegistryError::EmptyName,
        }
    }
}

pub struct Registry {
    gallery: SharedGallery,
    store: Arc<Store>,
    analyzer: SharedAnalyzer,
    known_faces_dir: PathBuf,
    min_face_size: f32,
}

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

impl Registry {
    pub fn new(
        store: Arc<Store>,
        analyzer: SharedAnalyzer,
        known_faces_dir: PathBuf,
        min_face_size: f32,
    ) -> Self {
        Self {
            gallery: Arc::new(RwLock::new(Gallery::new())),
            store,
            analyzer,
            known_faces_dir,
            min_face_size,
        }
    }

    /// Read handle for the matcher.
    pub fn gallery(&self) -> SharedGallery {
        Arc::clone(&self.gallery)
    }

    pub fn len(&self) -> usize {
        self.gallery.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Load persisted persons, then register any unregistered images found
    /// in the known-faces directory. Returns the gallery size.
    pub fn load(&self) -> Result<usize, RegistryError> {
        let persons = self.store.load_known_persons()?;
        {
            let mut gallery = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
            *gallery = Gallery::new();
            for person in persons {
                if let Err(e) = gallery.insert(person) {
                    tracing::warn!(error = %e, "skipping stored person");
                }
            }
        }
        self.scan_known_faces_dir();
        Ok(self.len())
    }

    fn scan_known_faces_dir(&self) {
        let entries = match std::fs::read_dir(&self.known_faces_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.known_faces_dir.display(), error = %e, "known faces dir not readable");
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image(p))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if self.contains(&name) {
                continue;
            }
            match self.register(&name, &path) {
                Ok(_) => tracing::info!(name, path = %path.display(), "registered from known faces dir"),
                Err(e) => tracing::warn!(name, path = %path.display(), error = %e, "skipping known face image"),
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gallery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Register `name` from a single-face image.
    ///
    /// Blocks on the analyzer; call from a blocking context.
    pub fn register(&self, name: &str, image_path: &Path) -> Result<KnownPerson, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        validate_name(name)?;
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        let image = image::open(image_path)?.to_rgb8();
        let faces = {
            let mut analyzer = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            analyzer.analyze(&image)?
        };
        let mut qualifying: Vec<_> = faces
            .into_iter()
            .filter(|f| f.bbox.meets_min_size(self.min_face_size))
            .collect();
        let face = match qualifying.len() {
            0 => return Err(RegistryError::NoFace),
            1 => qualifying.remove(0),
            n => return Err(RegistryError::MultipleFaces(n)),
        };

        let (stored_path, copied) = self.copy_into_known_faces(name, image_path)?;
        let person = KnownPerson {
            name: name.to_string(),
            embedding: face.embedding,
            image_path: Some(stored_path.clone()),
        };

        let rollback_file = || {
            if copied {
                let _ = std::fs::remove_file(&stored_path);
            }
        };

        if let Err(e) = self
            .store
            .insert_known_person(name, Some(&stored_path), &person.embedding)
        {
            rollback_file();
            return Err(match e {
                StoreError::Duplicate(n) => RegistryError::Duplicate(n),
                other => other.into(),
            });
        }

        let inserted = self
            .gallery
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(person.clone());
        if let Err(e) = inserted {
            let _ = self.store.delete_known_person(name);
            rollback_file();
            return Err(e.into());
        }

        tracing::info!(name, confidence = face.confidence, "known person registered");
        Ok(person)
    }

    /// Copy the source image into the known-faces directory unless it is
    /// already there. Returns the stored path and whether a copy was made.
    fn copy_into_known_faces(&self, name: &str, src: &Path) -> Result<(PathBuf, bool), RegistryError> {
        if src.parent() == Some(self.known_faces_dir.as_path()) {
            return Ok((src.to_path_buf(), false));
        }
        let ext = src
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .filter(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
            .unwrap_or_else(|| "jpg".to_string());
        std::fs::create_dir_all(&self.known_faces_dir)?;
        let dest = self.known_faces_dir.join(format!("{name}.{ext}"));

        // Never overwrite: the rollback path deletes what it copied
        let mut out = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => RegistryError::ImageExists(dest.clone()),
                _ => e.into(),
            })?;
        let copied = std::fs::File::open(src).and_then(|mut input| std::io::copy(&mut input, &mut out));
        if let Err(e) = copied {
            let _ = std::fs::remove_file(&dest);
            return Err(e.into());
        }
        Ok((dest, true))
    }

    /// Remove `name` from the store and the gallery.
    pub fn remove(&self, name: &str) -> Result<KnownPerson, RegistryError> {
        if !self.contains(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        self.store.delete_known_person(name)?;
        let person = self
            .gallery
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        // A leftover image would be re-registered by the next startup scan
        if let Some(path) = &person.image_path {
            if path.parent() == Some(self.known_faces_dir.as_path()) {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "could not delete known face image");
                }
            }
        }

        tracing::info!(name, "known person removed");
        Ok(person)
    }
}

/// Names become file stems in the known-faces directory and must not
/// collide with the unrecognized label.
fn validate_name(name: &str) -> Result<(), RegistryError> {
    let invalid = name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.eq_ignore_ascii_case(IdentityLabel::Unrecognized.person_id());
    if invalid {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use vigil_core::{BoundingBox, Embedding, FaceObservation};

    /// Analyzer that reports one face per bright-red 40x40 marker block in
    /// the top row of 40px cells. The embedding encodes the marker's green
    /// channel so different images produce different identities.
    pub(crate) struct MarkerAnalyzer;

    impl FaceAnalyzer for MarkerAnalyzer {
        fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
            let mut faces = Vec::new();
            let mut x = 0;
            while x + 40 <= frame.width() && frame.height() >= 40 {
                let p = frame.get_pixel(x + 20, 20).0;
                if p[0] == 255 {
                    let g = p[1] as f32 / 255.0;
                    faces.push(FaceObservation {
                        bbox: BoundingBox::new(x as f32, 0.0, x as f32 + 40.0, 40.0),
                        confidence: 0.9,
                        embedding: Embedding::new(vec![1.0, g, 1.0 - g]),
                        landmarks: None,
                    });
                }
                x += 40;
            }
            Ok(faces)
        }
    }

    pub(crate) fn marker_image(markers: &[u8]) -> RgbImage {
        let mut img = RgbImage::new(40 * markers.len().max(1) as u32, 40);
        for (i, g) in markers.iter().enumerate() {
            for y in 0..40 {
                for x in 0..40 {
                    img.put_pixel(i as u32 * 40 + x, y, Rgb([255, *g, 0]));
                }
            }
        }
        img
    }

    fn setup() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Registry::new(
            store,
            share_analyzer(Box::new(MarkerAnalyzer)),
            dir.path().join("known_faces"),
            30.0,
        );
        (dir, registry)
    }

    fn in_store(reg: &Registry, name: &str) -> bool {
        reg.store
            .list_known_persons()
            .unwrap()
            .iter()
            .any(|p| p.name == name)
    }

    fn write_image(dir: &Path, file: &str, markers: &[u8]) -> PathBuf {
        let path = dir.join(file);
        marker_image(markers).save(&path).unwrap();
        path
    }

    #[test]
    fn test_register_single_face() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "alice_src.png", &[10]);

        let person = reg.register("alice", &src).unwrap();
        assert_eq!(person.name, "alice");
        let stored = person.image_path.unwrap();
        assert!(stored.starts_with(dir.path().join("known_faces")));
        assert!(stored.exists());
        assert!(reg.contains("alice"));
        assert!(in_store(&reg, "alice"));
    }

    #[test]
    fn test_register_rejects_zero_and_multiple_faces() {
        let (dir, reg) = setup();
        let blank = dir.path().join("blank.png");
        RgbImage::new(80, 40).save(&blank).unwrap();
        let two = write_image(dir.path(), "two.png", &[10, 200]);

        assert!(matches!(reg.register("x", &blank), Err(RegistryError::NoFace)));
        assert!(matches!(reg.register("x", &two), Err(RegistryError::MultipleFaces(2))));
        assert_eq!(reg.len(), 0);
        assert!(!in_store(&reg, "x"));
        assert!(!dir.path().join("known_faces/x.png").exists());
    }

    #[test]
    fn test_register_duplicate_and_empty_name() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "a.png", &[10]);
        reg.register("alice", &src).unwrap();
        assert!(matches!(reg.register("alice", &src), Err(RegistryError::Duplicate(_))));
        assert!(matches!(reg.register("  ", &src), Err(RegistryError::EmptyName)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_rejects_path_like_and_reserved_names() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "src.png", &[10]);

        for name in ["../escaped", "/tmp/vigil-abs", "a/b", "a\\b", "..", ".hidden", "unknown", "Unknown"] {
            assert!(
                matches!(reg.register(name, &src), Err(RegistryError::InvalidName(_))),
                "{name} was accepted"
            );
        }
        assert!(!dir.path().join("escaped.png").exists());
        assert!(!Path::new("/tmp/vigil-abs.png").exists());
        assert_eq!(reg.len(), 0);
        assert!(reg.store.list_known_persons().unwrap().is_empty());
        assert!(!dir.path().join("known_faces").exists());
    }

    #[test]
    fn test_register_never_overwrites_existing_image() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "src.png", &[10]);
        let known = dir.path().join("known_faces");
        std::fs::create_dir_all(&known).unwrap();
        let existing = known.join("alice.png");
        std::fs::write(&existing, b"keep me").unwrap();

        assert!(matches!(reg.register("alice", &src), Err(RegistryError::ImageExists(_))));
        assert_eq!(std::fs::read(&existing).unwrap(), b"keep me");
        assert!(!reg.contains("alice"));
        assert!(!in_store(&reg, "alice"));
    }

    #[test]
    fn test_registered_image_matches_itself() {
        use vigil_core::{CosineMatcher, Matcher};

        let (dir, reg) = setup();
        let src = write_image(dir.path(), "alice_src.png", &[10]);
        reg.register("alice", &src).unwrap();
        write_image(dir.path(), "bob_src.png", &[200]);
        reg.register("bob", &dir.path().join("bob_src.png")).unwrap();

        let faces = MarkerAnalyzer.analyze(&marker_image(&[10])).unwrap();
        assert_eq!(faces.len(), 1);
        let gallery = reg.gallery();
        let gallery = gallery.read().unwrap();
        let result = CosineMatcher.best_match(&faces[0].embedding, &gallery, 0.6);
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert!(result.similarity >= 0.6);
    }

    #[test]
    fn test_register_unreadable_image() {
        let (dir, reg) = setup();
        let bogus = dir.path().join("bogus.jpg");
        std::fs::write(&bogus, b"not an image").unwrap();
        assert!(matches!(reg.register("x", &bogus), Err(RegistryError::Image(_))));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_remove_updates_store_and_gallery() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "b.png", &[10]);
        let stored = reg.register("bob", &src).unwrap().image_path.unwrap();

        reg.remove("bob").unwrap();
        assert!(!reg.contains("bob"));
        assert!(!in_store(&reg, "bob"));
        assert!(!stored.exists());
        assert!(matches!(reg.remove("bob"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_load_restores_and_scans_dir() {
        let (dir, reg) = setup();
        let src = write_image(dir.path(), "c.png", &[10]);
        reg.register("carol", &src).unwrap();

        // A fresh registry over the same store and directory
        let known = dir.path().join("known_faces");
        write_image(&known, "dave.png", &[200]);
        let reg2 = Registry::new(
            Arc::clone(&reg.store),
            share_analyzer(Box::new(MarkerAnalyzer)),
            known,
            30.0,
        );
        assert_eq!(reg2.load().unwrap(), 2);
        assert!(reg2.contains("carol"));
        assert!(reg2.contains("dave"));
    }
}
