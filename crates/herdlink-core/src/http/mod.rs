//! HTTP plumbing: the transport seam, cookie access, request coalescing and
//! the request pipeline that ties signing, gating and refresh together.

pub mod coalesce;
pub mod cookies;
pub mod pipeline;
pub mod transport;

pub use coalesce::RequestCoalescer;
pub use cookies::{parse_cookie_header, CookieSource, JarCookies, StaticCookies};
pub use pipeline::{ApiRequest, RequestPipeline};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
