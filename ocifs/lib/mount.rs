//! The mount lifecycle and the kernel-adapter seam.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use oci_spec::image::{Digest, ImageConfiguration};
use tokio::sync::{Mutex, Notify};
use unionfs::{unify, UnionFs, UnionFsOptions};

use crate::{
    distribution::{DockerRegistry, RegistryClient},
    store::{Image, PullPolicy, Store},
    utils, CancelToken, Keychain, OcifsError, OcifsResult, Reference,
};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Binds a constructed filesystem tree to the operating system.
///
/// The core builds the tree and manages its lifecycle; how the tree reaches
/// the kernel (FUSE, NFS, anything else) is the host binary's business,
/// expressed through this seam.
#[async_trait::async_trait]
pub trait MountAdapter: Send + Sync {
    /// Registers `root` at `mount_point` and returns a handle controlling
    /// the attachment.
    async fn attach(
        &self,
        root: Arc<UnionFs>,
        mount_point: &Path,
    ) -> OcifsResult<Box<dyn MountHandle>>;
}

/// Controls one attachment created by a [`MountAdapter`].
#[async_trait::async_trait]
pub trait MountHandle: Send + Sync {
    /// Blocks until the mount detaches.
    async fn wait(&self) -> OcifsResult<()>;

    /// Detaches the mount.
    async fn detach(&self) -> OcifsResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An adapter that keeps the tree registered in-process without binding it
/// to any kernel transport. Consumers (and tests) drive the tree's nodes
/// directly through [`ImageMount::tree`].
#[derive(Debug, Default)]
pub struct NullAdapter;

#[derive(Debug, Default)]
struct NullHandle {
    detached: AtomicBool,
    notify: Notify,
}

/// Builds an [`OciFs`].
#[derive(Default)]
pub struct OciFsBuilder {
    work_dir: Option<PathBuf>,
    keychain: Keychain,
    pull_policy: PullPolicy,
    client: Option<Arc<dyn RegistryClient>>,
    adapter: Option<Arc<dyn MountAdapter>>,
}

/// The entry point: a work directory, a registry client and a pull policy,
/// from which images are mounted.
pub struct OciFs {
    store: Store,
    adapter: Arc<dyn MountAdapter>,
    active_mounts: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Options for one mount.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    target_path: Option<PathBuf>,
    id: Option<String>,
    extra_dirs: Vec<String>,
    writable_dir: Option<PathBuf>,
    cancel: Option<CancelToken>,
}

/// A mounted image.
pub struct ImageMount {
    image: Image,
    root: Arc<UnionFs>,
    handle: Box<dyn MountHandle>,
    mount_point: PathBuf,
    active_mounts: Arc<Mutex<HashSet<PathBuf>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciFsBuilder {
    /// Sets the work directory (defaults to `ocifs` under the system temp
    /// directory).
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Sets the keychain consulted for registry credentials.
    pub fn keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = keychain;
        self
    }

    /// Sets the pull policy (defaults to [`PullPolicy::IfNotPresent`]).
    pub fn pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Replaces the registry client (defaults to a [`DockerRegistry`] using
    /// the configured keychain).
    pub fn registry(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replaces the mount adapter (defaults to [`NullAdapter`]).
    pub fn adapter(mut self, adapter: Arc<dyn MountAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Opens the store and builds the [`OciFs`].
    pub async fn build(self) -> OcifsResult<OciFs> {
        let work_dir = self.work_dir.unwrap_or_else(utils::default_work_dir);
        let client = match self.client {
            Some(client) => client,
            None => Arc::new(DockerRegistry::with_keychain(self.keychain)),
        };
        let store = Store::open(work_dir, client, self.pull_policy).await?;

        Ok(OciFs {
            store,
            adapter: self
                .adapter
                .unwrap_or_else(|| Arc::new(NullAdapter)),
            active_mounts: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

impl OciFs {
    /// Returns a builder.
    pub fn builder() -> OciFsBuilder {
        OciFsBuilder::default()
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Mounts the image behind `image_ref`.
    ///
    /// The reference is resolved under the configured pull policy, the
    /// image's layers are flattened into a union view, the writable layer is
    /// opened when one is configured, and the resulting tree is handed to
    /// the mount adapter.
    pub async fn mount(&self, image_ref: &str, options: MountOptions) -> OcifsResult<ImageMount> {
        let reference: Reference = image_ref.parse()?;
        let cancel = options.cancel.clone().unwrap_or_default();

        let digest = self.store.resolve(&reference, &cancel).await?;
        let image = self.store.image(&digest).await?;

        let mount_point = match &options.target_path {
            Some(path) => absolutize(path)?,
            None => self.store.new_mount_dir(options.id.as_deref()).await?,
        };

        {
            let mut active = self.active_mounts.lock().await;
            if !active.insert(mount_point.clone()) {
                return Err(OcifsError::AlreadyMounted(mount_point));
            }
        }

        match self.attach(image, options, &mount_point).await {
            Result::Ok(mount) => Ok(mount),
            Err(err) => {
                self.active_mounts.lock().await.remove(&mount_point);
                Err(err)
            }
        }
    }

    async fn attach(
        &self,
        image: Image,
        options: MountOptions,
        mount_point: &Path,
    ) -> OcifsResult<ImageMount> {
        let files = unify(&image.layer_slices());

        let mut fs_options = UnionFsOptions::default().with_extra_dirs(options.extra_dirs);
        if let Some(dir) = options.writable_dir {
            fs_options = fs_options.with_writable_dir(dir);
        }
        let root = UnionFs::init(files, fs_options).await?;

        let handle = self.adapter.attach(Arc::clone(&root), mount_point).await?;
        tracing::info!(mount_point = %mount_point.display(), "mounted");

        Ok(ImageMount {
            image,
            root,
            handle,
            mount_point: mount_point.to_path_buf(),
            active_mounts: Arc::clone(&self.active_mounts),
        })
    }
}

impl MountOptions {
    /// Mounts at `path` instead of an auto-created directory under the work
    /// dir.
    pub fn with_target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    /// Names the auto-created mount directory.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Directories to present even when the image carries no content for
    /// them.
    pub fn with_extra_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Enables the writable overlay, rooted at `dir`.
    pub fn with_writable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.writable_dir = Some(dir.into());
        self
    }

    /// Cancels the pull phase of the mount when the token fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl ImageMount {
    /// Returns the image configuration.
    pub fn config(&self) -> &ImageConfiguration {
        self.image.get_config()
    }

    /// Returns the digest the mounted reference resolved to.
    pub fn digest(&self) -> &Digest {
        self.image.get_digest()
    }

    /// Returns the mount point.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Returns the filesystem tree, for adapters and direct consumers.
    pub fn tree(&self) -> &Arc<UnionFs> {
        &self.root
    }

    /// Blocks until the mount detaches, then persists the writable layer.
    pub async fn wait(&self) -> OcifsResult<()> {
        self.handle.wait().await?;
        self.finish().await
    }

    /// Detaches the mount and persists the writable layer.
    pub async fn unmount(&self) -> OcifsResult<()> {
        self.handle.detach().await?;
        self.finish().await
    }

    async fn finish(&self) -> OcifsResult<()> {
        self.active_mounts.lock().await.remove(&self.mount_point);
        self.root.persist_writable().await?;
        tracing::info!(mount_point = %self.mount_point.display(), "unmounted");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl MountAdapter for NullAdapter {
    async fn attach(
        &self,
        _root: Arc<UnionFs>,
        _mount_point: &Path,
    ) -> OcifsResult<Box<dyn MountHandle>> {
        Ok(Box::new(NullHandle::default()))
    }
}

#[async_trait::async_trait]
impl MountHandle for NullHandle {
    async fn wait(&self) -> OcifsResult<()> {
        loop {
            let notified = self.notify.notified();
            if self.detached.load(Ordering::Acquire) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn detach(&self) -> OcifsResult<()> {
        self.detached.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a mount point against the current directory when relative.
fn absolutize(path: &Path) -> OcifsResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
