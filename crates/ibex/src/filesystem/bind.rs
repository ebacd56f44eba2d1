//! Bind path specifications.
//!
//! Two surface syntaxes feed into [`BindPath`]: the colon-separated
//! `--bind src[:dest[:opts]]` form and the comma-separated `--mount`
//! key=value form. An `image-src`/`id` option turns a bind into an
//! *image-interior* mount: the source is an image file whose contents are
//! exposed through a FUSE mount, and plain-bind semantics no longer apply.

use std::path::PathBuf;

use ibex_common::{IbexError, IbexResult};

/// A parsed bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPath {
    /// Host-side source path (or image file for image binds).
    pub source: PathBuf,
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Mount read-only.
    pub readonly: bool,
    /// Path inside the image to expose (image binds only).
    pub image_src: Option<PathBuf>,
    /// Descriptor index inside the image (image binds only).
    pub image_id: Option<u32>,
}

impl BindPath {
    /// Plain host bind.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, readonly: bool) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            readonly,
            image_src: None,
            image_id: None,
        }
    }

    /// Whether this bind goes through a FUSE image mount.
    #[must_use]
    pub fn is_image_bind(&self) -> bool {
        self.image_src.is_some() || self.image_id.is_some()
    }

    /// Parse a `--bind` specification: `src[:dest[:opt[,opt...]]]`.
    pub fn parse(spec: &str) -> IbexResult<Self> {
        let mut parts = spec.splitn(3, ':');
        let source = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IbexError::config(format!("empty bind specification: {spec:?}")))?;
        let dest = parts.next().filter(|s| !s.is_empty()).unwrap_or(source);

        let mut bind = Self::new(source, dest, false);
        if let Some(opts) = parts.next() {
            for opt in opts.split(',') {
                bind.apply_option(opt, spec)?;
            }
        }
        bind.validate(spec)?;
        Ok(bind)
    }

    /// Parse a `--mount` specification: `type=bind,source=..,destination=..[,..]`.
    pub fn parse_mount(spec: &str) -> IbexResult<Self> {
        let mut source = None;
        let mut dest = None;
        let mut opts = Vec::new();

        for field in spec.split(',') {
            match field.split_once('=') {
                Some(("type", v)) if v == "bind" => {}
                Some(("type", v)) => {
                    return Err(IbexError::config(format!("unsupported mount type: {v}")));
                }
                Some(("source" | "src", v)) => source = Some(v),
                Some(("destination" | "dst" | "target", v)) => dest = Some(v),
                _ => opts.push(field),
            }
        }

        let source = source
            .ok_or_else(|| IbexError::config(format!("mount without source: {spec:?}")))?;
        let dest =
            dest.ok_or_else(|| IbexError::config(format!("mount without destination: {spec:?}")))?;

        let mut bind = Self::new(source, dest, false);
        for opt in opts {
            bind.apply_option(opt, spec)?;
        }
        bind.validate(spec)?;
        Ok(bind)
    }

    fn apply_option(&mut self, opt: &str, spec: &str) -> IbexResult<()> {
        match opt.split_once('=') {
            None if opt == "ro" || opt == "readonly" => self.readonly = true,
            None if opt == "rw" => self.readonly = false,
            Some(("image-src", v)) => self.image_src = Some(PathBuf::from(v)),
            Some(("id", v)) => {
                let id = v
                    .parse()
                    .map_err(|_| IbexError::config(format!("invalid image id in {spec:?}")))?;
                self.image_id = Some(id);
            }
            _ => {
                return Err(IbexError::config(format!(
                    "unknown bind option {opt:?} in {spec:?}"
                )));
            }
        }
        Ok(())
    }

    fn validate(&self, spec: &str) -> IbexResult<()> {
        if self.image_id.is_some() && self.image_src.is_none() {
            return Err(IbexError::config(format!(
                "id= requires image-src= in {spec:?}"
            )));
        }
        if !self.destination.is_absolute() {
            return Err(IbexError::config(format!(
                "bind destination must be absolute in {spec:?}"
            )));
        }
        Ok(())
    }
}
