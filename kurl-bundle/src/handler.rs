//! The bundle endpoint: resolve, validate, then stream.
//!
//! A request moves through [`Phase`]s in order. Everything up to and
//! including preflight happens before the response is committed and can
//! still produce an error status; after that, failures can only cut the
//! body short.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio_stream::wrappers::ReceiverStream;

use crate::allowlist::RegistryAllowlist;
use crate::compose::Compositor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::image::{ImageMaterializer, RegistryMaterializer};
use crate::manifest::{BundleManifest, InstallerRequest, Lookup, ManifestResolver};
use crate::preflight::Preflight;
use crate::stream::{self, AbortHandle};
use crate::telemetry::{self, LogReporter, Reporter, RequestContext};

/// Methods the bundle routes answer.
const ALLOW: &str = "GET, HEAD, OPTIONS";

/// Stage of a bundle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Fetching the manifest from upstream.
    ResolvingManifest,
    /// Allowlist and layer reachability checks.
    PreflightValidating,
    /// Pulling and appending images.
    StreamingImages,
    /// Relaying remote layers.
    StreamingLayers,
    /// Appending inline files.
    StreamingFiles,
    /// Archive complete.
    Done,
    /// Request failed.
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ResolvingManifest => "resolving-manifest",
            Self::PreflightValidating => "preflight-validating",
            Self::StreamingImages => "streaming-images",
            Self::StreamingLayers => "streaming-layers",
            Self::StreamingFiles => "streaming-files",
            Self::Done => "done",
            Self::Aborted => "aborted",
        })
    }
}

/// Logs entry into `phase`.
fn enter(phase: Phase, ctx: &RequestContext) {
    tracing::debug!(installer_id = %ctx.installer_id, %phase, "bundle phase");
}

/// Shared state behind the bundle routes.
#[derive(Debug)]
pub struct Bundler {
    /// Service configuration.
    config: Config,
    /// Shared outbound HTTP agent.
    agent: ureq::Agent,
    /// Upstream manifest lookups.
    resolver: ManifestResolver,
    /// Registries images may come from.
    allowlist: RegistryAllowlist,
    /// Produces one docker-archive per image.
    materializer: Arc<dyn ImageMaterializer>,
    /// Error sink.
    reporter: Arc<dyn Reporter>,
}

/// Builder for [`Bundler`]. Unset collaborators get their production defaults.
#[derive(Debug)]
#[must_use = "a BundlerBuilder does nothing until .build() is called"]
pub struct BundlerBuilder {
    /// Service configuration.
    config: Config,
    /// Allowlist override.
    allowlist: Option<RegistryAllowlist>,
    /// Materializer override.
    materializer: Option<Arc<dyn ImageMaterializer>>,
    /// Reporter override.
    reporter: Option<Arc<dyn Reporter>>,
}

impl BundlerBuilder {
    /// Replaces the default registry allowlist.
    pub fn allowlist(mut self, allowlist: RegistryAllowlist) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    /// Replaces the registry-backed image materializer.
    pub fn materializer(mut self, materializer: Arc<dyn ImageMaterializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Replaces the log-backed error reporter.
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Finalizes the state.
    pub fn build(self) -> Bundler {
        let agent = kurl_bundle_oci::agent(self.config.http_timeout);
        let resolver = ManifestResolver::new(agent.clone(), self.config.upstream.clone());
        let materializer = self
            .materializer
            .unwrap_or_else(|| Arc::new(RegistryMaterializer::new(agent.clone())));
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(LogReporter::new(self.config.release_stage.clone())));
        Bundler {
            allowlist: self.allowlist.unwrap_or_default(),
            config: self.config,
            agent,
            resolver,
            materializer,
            reporter,
        }
    }
}

impl Bundler {
    /// Starts building state for `config`.
    pub const fn builder(config: Config) -> BundlerBuilder {
        BundlerBuilder {
            config,
            allowlist: None,
            materializer: None,
            reporter: None,
        }
    }

    /// Service configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves the manifest and, if found, runs preflight. Blocking.
    fn prepare(
        &self,
        installer: &InstallerRequest,
        headers: &HeaderMap,
        client_ip: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Lookup> {
        enter(Phase::ResolvingManifest, ctx);
        let lookup = self.resolver.resolve(installer, headers, client_ip)?;
        if let Lookup::Found(manifest) = &lookup {
            enter(Phase::PreflightValidating, ctx);
            Preflight::new(&self.agent, &self.allowlist).check(manifest)?;
        }
        Ok(lookup)
    }

    /// Writes the whole archive into `sink`. Blocking; runs after commitment.
    ///
    /// Every failure is recorded here. An `Err` tells the caller to abort the
    /// body; on `Ok` the sink has been flushed and dropped, ending it cleanly.
    fn compose<W: Write>(
        &self,
        manifest: &BundleManifest,
        sink: W,
        ctx: &RequestContext,
    ) -> Result<()> {
        let mut compositor = Compositor::new(sink);
        let outcome = self.append_all(&mut compositor, manifest, ctx);
        if let Err(e) = &outcome {
            enter(Phase::Aborted, ctx);
            self.record(e, ctx);
        }

        // Both streams are closed whatever happened above.
        let closed = compositor.finish();
        if let Err(e) = &closed {
            if outcome.is_ok() {
                enter(Phase::Aborted, ctx);
            }
            self.record(e, ctx);
        }
        outcome?;
        closed?;
        enter(Phase::Done, ctx);
        Ok(())
    }

    /// Runs the producers in archive order.
    fn append_all<W: Write>(
        &self,
        compositor: &mut Compositor<W>,
        manifest: &BundleManifest,
        ctx: &RequestContext,
    ) -> Result<()> {
        enter(Phase::StreamingImages, ctx);
        compositor.append_images(
            &manifest.images,
            self.materializer.as_ref(),
            &self.config.scratch_dir,
        )?;
        enter(Phase::StreamingLayers, ctx);
        compositor.append_layers(&manifest.layers, &self.agent)?;
        enter(Phase::StreamingFiles, ctx);
        compositor.append_files(&manifest.files)
    }

    /// Logs `error` and forwards it to the reporter.
    fn record(&self, error: &Error, ctx: &RequestContext) {
        tracing::error!(installer_id = %ctx.installer_id, "{}", telemetry::chain(error));
        self.reporter.report(error, ctx);
    }

    /// Records `error` and converts it to a response without leaking details.
    fn fail(&self, error: &Error, ctx: &RequestContext) -> Response {
        self.record(error, ctx);
        let status = error.status();
        plain_text(status, status.canonical_reason().unwrap_or_default())
    }
}

/// Builds the router serving both bundle routes.
pub fn router(bundler: Arc<Bundler>) -> Router {
    Router::new()
        .route("/bundle/:installer_id", any(bundle))
        .route(
            "/bundle/version/:kurl_version/:installer_id",
            any(bundle_versioned),
        )
        .with_state(bundler)
}

/// `/bundle/:installer_id`
async fn bundle(
    State(bundler): State<Arc<Bundler>>,
    Path(installer_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let installer = InstallerRequest::new(&installer_id, None);
    serve(bundler, installer, &method, &uri, headers, remote).await
}

/// `/bundle/version/:kurl_version/:installer_id`
async fn bundle_versioned(
    State(bundler): State<Arc<Bundler>>,
    Path((kurl_version, installer_id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let installer = InstallerRequest::new(&installer_id, Some(kurl_version));
    serve(bundler, installer, &method, &uri, headers, remote).await
}

/// Shared body of both bundle routes.
async fn serve(
    bundler: Arc<Bundler>,
    installer: InstallerRequest,
    method: &Method,
    uri: &Uri,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if method == Method::OPTIONS {
        return cors_preflight();
    }
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed();
    }
    tracing::info!("{method} {}", uri.path());

    let ctx = RequestContext::new(
        method.as_str(),
        uri.path(),
        &installer.installer_id,
        installer.kurl_version.as_deref(),
    );
    let client_ip = remote.map(|ConnectInfo(addr)| addr.ip().to_string());

    let preparer = Arc::clone(&bundler);
    let prepare_ctx = ctx.clone();
    let prepared = tokio::task::spawn_blocking(move || {
        preparer.prepare(&installer, &headers, client_ip.as_deref(), &prepare_ctx)
    })
    .await;
    let manifest = match prepared.unwrap_or_else(|e| Err(Error::from(e))) {
        Ok(Lookup::Found(manifest)) => manifest,
        Ok(Lookup::Missing(body)) => {
            tracing::info!(installer_id = %ctx.installer_id, "installer not found upstream");
            return plain_text(StatusCode::NOT_FOUND, &body);
        }
        Err(e) => {
            enter(Phase::Aborted, &ctx);
            return bundler.fail(&e, &ctx);
        }
    };

    if method == Method::HEAD {
        return committed(Body::empty());
    }

    let (sink, rx) = stream::channel();
    let abort = sink.abort_handle();
    tokio::spawn(supervise(bundler, manifest, sink, abort, ctx));
    committed(Body::from_stream(ReceiverStream::new(rx)))
}

/// Runs composition off the runtime and turns any failure, panics included,
/// into an aborted body.
async fn supervise(
    bundler: Arc<Bundler>,
    manifest: BundleManifest,
    sink: stream::ChunkWriter,
    abort: AbortHandle,
    ctx: RequestContext,
) {
    let composer = Arc::clone(&bundler);
    let compose_ctx = ctx.clone();
    let joined =
        tokio::task::spawn_blocking(move || composer.compose(&manifest, sink, &compose_ctx)).await;
    let error = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(join) => {
            let e = Error::from(join);
            enter(Phase::Aborted, &ctx);
            bundler.record(&e, &ctx);
            e
        }
    };
    abort.abort(telemetry::chain(&error)).await;
}

/// Success headers; once returned, the status is final.
fn committed(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "binary/octet-stream"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CONTENT_DISPOSITION, "attachment"),
            (header::TRANSFER_ENCODING, "chunked"),
        ],
        body,
    )
        .into_response()
}

/// Answer to a CORS preflight `OPTIONS`.
fn cors_preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Access-Control-Allow-Origin, Content-Type",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}

/// `405` carrying the `Allow` header.
fn method_not_allowed() -> Response {
    let mut resp = plain_text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    resp.headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static(ALLOW));
    resp
}

/// Text response ending in a newline.
fn plain_text(status: StatusCode, body: &str) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        format!("{body}\n"),
    )
        .into_response()
}
