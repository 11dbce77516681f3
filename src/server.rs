// ABOUTME: HTTP and HTTPS request surface; every path goes to the script's http/https function
// ABOUTME: Each request runs in a fresh request engine on a blocking thread

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use luabot_core::config::HttpsOption;
use luabot_core::log_relay::Logger;
use luabot_core::metrics;
use mlua::{Table, UserData, UserDataFields, UserDataMethods, Value as LuaValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::engine::{EngineFactory, Purpose};

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const INTERNAL_ERROR: &str = "Internal Server Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Also the name of the script function that serves the scheme
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Clone)]
struct SurfaceState {
    factory: Arc<EngineFactory>,
    logger: Logger,
    scheme: Scheme,
}

/// Everything a script can read about one request
#[derive(Debug, Clone, Default)]
pub struct HttpRequestData {
    pub method: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub scheme: String,
    pub url: String,
    pub remote_addr: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequestData {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }
}

/// `req` argument of `http(req)` / `https(req)`
pub struct LuaRequest(pub HttpRequestData);

impl UserData for LuaRequest {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("method", |_, this| Ok(this.0.method.clone()));
        fields.add_field_method_get("path", |_, this| Ok(this.0.path.clone()));
        fields.add_field_method_get("query", |_, this| Ok(this.0.query.clone()));
        fields.add_field_method_get("host", |_, this| Ok(this.0.host.clone()));
        fields.add_field_method_get("scheme", |_, this| Ok(this.0.scheme.clone()));
        fields.add_field_method_get("url", |_, this| Ok(this.0.url.clone()));
        fields.add_field_method_get("remote_addr", |_, this| Ok(this.0.remote_addr.clone()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("header", |_, this, name: String| {
            Ok(this.0.header(&name).map(str::to_string))
        });
        methods.add_method("headers", |lua, this, ()| {
            let table = lua.create_table_with_capacity(this.0.headers.len(), 0)?;
            for (i, (name, value)) in this.0.headers.iter().enumerate() {
                table.raw_set(i + 1, lua.create_sequence_from([name.as_str(), value.as_str()])?)?;
            }
            Ok(table)
        });
        methods.add_method("cookie", |_, this, name: String| Ok(this.0.cookie(&name)));
        methods.add_method("read", |lua, this, ()| lua.create_string(&this.0.body));
    }
}

/// What the script returned: `status, {{name, value}, ...}, body`
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScriptResponse {
    fn from_lua(status: LuaValue, headers: LuaValue, body: LuaValue) -> Result<Self> {
        let status = match status {
            LuaValue::Integer(code) => u16::try_from(code).ok(),
            LuaValue::Number(code) if code.fract() == 0.0 => u16::try_from(code as i64).ok(),
            _ => None,
        }
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| anyhow!("status must be an HTTP status code"))?;

        let headers = match headers {
            LuaValue::Nil => Vec::new(),
            LuaValue::Table(table) => header_pairs(&table)?,
            other => bail!("headers must be a table, got {}", other.type_name()),
        };
        let body = match body {
            LuaValue::Nil => Vec::new(),
            LuaValue::String(s) => s.as_bytes().to_vec(),
            LuaValue::Integer(i) => i.to_string().into_bytes(),
            LuaValue::Number(n) => n.to_string().into_bytes(),
            other => bail!("body must be a string, got {}", other.type_name()),
        };
        Ok(Self { status, headers, body })
    }

    fn into_response(self) -> Result<Response> {
        let mut response = Response::builder().status(StatusCode::from_u16(self.status)?);
        for (name, value) in &self.headers {
            response = response.header(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(response.body(Body::from(self.body))?)
    }
}

fn header_pairs(table: &Table) -> Result<Vec<(String, String)>> {
    table
        .sequence_values::<Table>()
        .map(|pair| {
            let pair = pair?;
            Ok((pair.get::<String>(1)?, pair.get::<String>(2)?))
        })
        .collect()
}

/// Build a request engine and call the scheme's entry point
pub fn call_script(factory: &Arc<EngineFactory>, scheme: Scheme, request: HttpRequestData) -> Result<ScriptResponse> {
    let engine = factory.build(Purpose::Request)?;
    let (status, headers, body): (LuaValue, LuaValue, LuaValue) =
        engine.call_global(scheme.as_str(), LuaRequest(request))?;
    ScriptResponse::from_lua(status, headers, body)
}

/// Router that sends every path to the script
pub fn router(factory: Arc<EngineFactory>, logger: Logger, scheme: Scheme) -> Router {
    let state = SurfaceState {
        factory,
        logger,
        scheme,
    };
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_request(State(state): State<SurfaceState>, request: Request) -> Response {
    let scheme = state.scheme;
    let response = match run_request(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            state.logger.error(format!("{} request failed: {:#}", scheme.as_str(), e));
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR).into_response()
        }
    };
    metrics::record_http_request(scheme.as_str(), response.status().as_u16());
    response
}

async fn run_request(state: &SurfaceState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("")
        .to_string();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();
    let scheme = state.scheme.as_str().to_string();
    let url = match query.as_str() {
        "" => format!("{}://{}{}", scheme, host, path),
        q => format!("{}://{}{}?{}", scheme, host, path, q),
    };
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .context("Failed to read request body")?
        .to_vec();

    let data = HttpRequestData {
        method: parts.method.to_string(),
        path,
        query,
        host,
        scheme,
        url,
        remote_addr,
        headers,
        body,
    };

    let factory = state.factory.clone();
    let scheme = state.scheme;
    let reply = tokio::task::spawn_blocking(move || call_script(&factory, scheme, data))
        .await
        .context("Request engine panicked")??;
    reply.into_response()
}

/// Bind `addr` now and serve plain HTTP in the background
pub fn serve_http(factory: Arc<EngineFactory>, logger: Logger, addr: &str) -> Result<JoinHandle<()>> {
    let listener = std::net::TcpListener::bind(addr).with_context(|| format!("Failed to bind http on {}", addr))?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let local = listener.local_addr()?;
    logger.info(format!("http server started on {}", local));

    let app = router(factory, logger.clone(), Scheme::Http);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
            logger.error(format!("http server stopped: {}", e));
        }
    }))
}

/// Serve HTTPS with the configured certificate and key in the background
pub fn serve_https(factory: Arc<EngineFactory>, logger: Logger, option: &HttpsOption) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = option
        .addr
        .parse()
        .with_context(|| format!("Invalid https address: {}", option.addr))?;
    for file in [&option.cert, &option.key] {
        if !file.exists() {
            bail!("https file not found: {}", file.display());
        }
    }
    let (cert, key) = (option.cert.clone(), option.key.clone());
    let app = router(factory, logger.clone(), Scheme::Https);

    Ok(tokio::spawn(async move {
        let config = match RustlsConfig::from_pem_file(&cert, &key).await {
            Ok(config) => config,
            Err(e) => {
                logger.error(format!("Failed to load https certificate: {}", e));
                return;
            }
        };
        logger.info(format!("https server started on {}", addr));
        let served = axum_server::bind_rustls(addr, config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await;
        if let Err(e) = served {
            logger.error(format!("https server stopped: {}", e));
        }
    }))
}
