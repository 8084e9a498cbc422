use crate::error::MatrixError;
use crate::utils::gen_random_string;

/// URL scheme, i.e. everything before `://`. A bare specifier such as
/// `inproc` is its own scheme.
pub fn scheme(url: &str) -> &str {
    match url.find("://") {
        Some(i) => &url[..i],
        None => url,
    }
}

/// Rank used when choosing how to reach a server from a client:
/// in-process beats ipc beats the network.
fn locality_rank(url: &str) -> u8 {
    match scheme(url) {
        "inproc" | "rtinproc" => 0,
        "ipc" => 1,
        "tcp" => 2,
        _ => 3,
    }
}

/// Pick the most local of the given endpoint URLs.
pub fn most_local(urls: &[String]) -> Option<&str> {
    urls.iter()
        .min_by_key(|u| locality_rank(u))
        .map(String::as_str)
}

/// The host's name, used to rewrite realized tcp endpoints so clients on
/// other machines can reach them. Falls back to `localhost` when the name
/// cannot be read.
pub fn canonical_hostname() -> String {
    match hostname::get() {
        Ok(h) => h.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!("unable to obtain hostname, using 'localhost': {e}");
            "localhost".to_string()
        }
    }
}

/// Expand a transport specifier into a bindable URL.
///
/// Bare scheme names get fully random endpoints; `ipc`/`inproc` URLs with a
/// trailing run of `X` have that run replaced by random alphanumerics of
/// the same length. tcp URLs pass through: their ephemeral-port handling
/// happens at bind time, when the realized port is known.
pub fn expand_specifier(spec: &str) -> String {
    match spec {
        "tcp" => "tcp://*:*".to_string(),
        "ipc" => format!("ipc:///tmp/matrix.{}", gen_random_string(10)),
        "inproc" | "rtinproc" => format!("{}://matrix.{}", spec, gen_random_string(20)),
        s if s.starts_with("tcp://") => s.to_string(),
        s => {
            let trimmed = s.trim_end_matches('X');
            let run = s.len() - trimmed.len();
            if run > 0 {
                format!("{}{}", trimmed, gen_random_string(run))
            } else {
                s.to_string()
            }
        }
    }
}

/// True when a tcp URL asks for an ephemeral port: `tcp://*`,
/// `tcp://*:*`, `tcp://host` (no port), or a port that is a run of `X`.
pub fn wants_ephemeral_port(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("tcp://") else {
        return false;
    };
    match rest.rsplit_once(':') {
        None => true,
        Some((_, port)) => port == "*" || port.is_empty() || port.chars().all(|c| c == 'X'),
    }
}

fn last_endpoint_port(sock: &zmq::Socket) -> Result<String, MatrixError> {
    let ep = sock
        .get_last_endpoint()?
        .map_err(|_| MatrixError::transport("last endpoint is not valid UTF-8"))?;
    ep.rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .ok_or_else(|| MatrixError::transport(format!("no port in endpoint '{ep}'")))
}

/// Bind `sock` to one (already expanded) URL and return the realized URL a
/// client may use. tcp endpoints come back as `tcp://<host>:<port>` with
/// the canonical host name; ipc/inproc bind and return as-is.
pub fn bind_endpoint(sock: &zmq::Socket, url: &str, host: &str) -> Result<String, MatrixError> {
    if url.starts_with("tcp://") {
        let port = if wants_ephemeral_port(url) {
            sock.bind("tcp://*:*")?;
            last_endpoint_port(sock)?
        } else {
            sock.bind(url)?;
            url.rsplit_once(':')
                .map(|(_, p)| p.to_string())
                .unwrap_or_default()
        };
        Ok(format!("tcp://{host}:{port}"))
    } else {
        sock.bind(url)?;
        Ok(url.to_string())
    }
}

/// Derive the publish endpoint paired with a state endpoint: tcp reuses
/// the host with port + 1, ipc/inproc get a `.publisher` suffix.
pub fn derive_pub_url(state_url: &str) -> Result<String, MatrixError> {
    let sch = scheme(state_url);
    match sch {
        "tcp" => {
            let port: u16 = state_url
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse().ok())
                .ok_or_else(|| {
                    MatrixError::config(format!("no usable port in tcp URL '{state_url}'"))
                })?;
            Ok(format!("tcp://*:{}", port + 1))
        }
        "ipc" | "inproc" => Ok(format!("{state_url}.publisher")),
        _ => Err(MatrixError::config(format!(
            "Unrecognized URL: {state_url}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_local_prefers_inproc_then_ipc() {
        let urls = vec![
            "tcp://ajax:52016".to_string(),
            "ipc:///tmp/matrix.x".to_string(),
            "inproc://matrix.a".to_string(),
        ];
        assert_eq!(most_local(&urls), Some("inproc://matrix.a"));
        assert_eq!(most_local(&urls[..2]), Some("ipc:///tmp/matrix.x"));
        assert_eq!(most_local(&[]), None);
    }

    #[test]
    fn specifier_expansion_replaces_x_runs() {
        let out = expand_specifier("inproc://matrix.nettask.XXXXX");
        assert_eq!(out.len(), "inproc://matrix.nettask.XXXXX".len());
        assert!(out.starts_with("inproc://matrix.nettask."));
        assert!(!out.ends_with("XXXXX"));
        let suffix = &out["inproc://matrix.nettask.".len()..];
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn bare_specifiers_become_random_endpoints() {
        assert_eq!(expand_specifier("tcp"), "tcp://*:*");
        assert!(expand_specifier("inproc").starts_with("inproc://matrix."));
        assert!(expand_specifier("ipc").starts_with("ipc:///tmp/matrix."));
    }

    #[test]
    fn ephemeral_detection() {
        assert!(wants_ephemeral_port("tcp://*"));
        assert!(wants_ephemeral_port("tcp://*:*"));
        assert!(wants_ephemeral_port("tcp://host:XXXXX"));
        assert!(!wants_ephemeral_port("tcp://host:42000"));
        assert!(!wants_ephemeral_port("inproc://foo"));
    }

    #[test]
    fn pub_url_derivation() {
        assert_eq!(derive_pub_url("tcp://*:42000").unwrap(), "tcp://*:42001");
        assert_eq!(
            derive_pub_url("inproc://matrix.keymaster").unwrap(),
            "inproc://matrix.keymaster.publisher"
        );
        assert!(derive_pub_url("foo://bar").is_err());
    }

    #[test]
    fn tcp_ephemeral_bind_realizes_host_and_port() {
        let sock = crate::utils::shared_context().socket(zmq::PUB).unwrap();
        let url = bind_endpoint(&sock, "tcp://*", "myhost").unwrap();
        let rest = url.strip_prefix("tcp://myhost:").unwrap();
        let port: u16 = rest.parse().unwrap();
        assert!(port > 1024);
    }
}
