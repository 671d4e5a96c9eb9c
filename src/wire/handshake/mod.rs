use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PROTOCOL_VERSION: i64 = 2;
pub const GREETING_PREFIX: &str = "HI";
pub const HELLO_VERB: &str = "HELLO";

/// Server greeting received once per connection, `+HI {"v":2,"s":"..","i":..}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Greeting {
    #[serde(rename = "v")]
    pub protocol_version: i64,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

#[derive(Debug)]
pub enum HandshakeError {
    MissingGreetingPrefix { line: String },
    MalformedGreeting(serde_json::Error),
    VersionMismatch { client: i64, server: i64 },
    Hostname(std::io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGreetingPrefix { line } => {
                write!(f, "expected '{GREETING_PREFIX} <json>' greeting, got '{line}'")
            }
            Self::MalformedGreeting(source) => write!(f, "malformed greeting payload: {source}"),
            Self::VersionMismatch { client, server } => write!(
                f,
                "client / server version mismatch: client {client}, server {server}"
            ),
            Self::Hostname(source) => write!(f, "failed to resolve local hostname: {source}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl Greeting {
    /// Parses the status text of the greeting reply (without the leading `+`).
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let Some((prefix, json)) = line.split_once(' ') else {
            return Err(HandshakeError::MissingGreetingPrefix {
                line: line.to_owned(),
            });
        };
        if prefix != GREETING_PREFIX {
            return Err(HandshakeError::MissingGreetingPrefix {
                line: line.to_owned(),
            });
        }

        serde_json::from_str(json).map_err(HandshakeError::MalformedGreeting)
    }
}

pub fn assert_version(server_version: i64) -> Result<(), HandshakeError> {
    if server_version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            client: PROTOCOL_VERSION,
            server: server_version,
        });
    }

    Ok(())
}

/// Worker identity attached to HELLO. Plain clients (producers) send none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub wid: String,
    pub labels: Vec<String>,
    pub pid: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Hello {
    pub hostname: String,
    pub v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
}

impl Hello {
    pub fn build(
        greeting: &Greeting,
        hostname: impl Into<String>,
        identity: Option<&WorkerIdentity>,
        password: Option<&str>,
    ) -> Self {
        let mut hello = Self {
            hostname: hostname.into(),
            v: PROTOCOL_VERSION,
            wid: None,
            pid: None,
            labels: None,
            pwdhash: None,
        };

        if let Some(identity) = identity {
            hello.wid = Some(identity.wid.clone());
            hello.pid = Some(identity.pid);
            hello.labels = Some(identity.labels.clone());
        }

        if let (Some(salt), Some(password)) = (greeting.salt.as_deref(), password) {
            if !salt.is_empty() && !password.is_empty() {
                let iterations = greeting.iterations.unwrap_or(1);
                hello.pwdhash = Some(password_hash(password, salt, iterations));
            }
        }

        hello
    }
}

pub fn local_hostname() -> Result<String, HandshakeError> {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .map_err(HandshakeError::Hostname)
}

/// `sha256(password + salt)`, then the raw digest re-hashed `iterations - 1`
/// more times, hex encoded.
pub fn password_hash(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{password}{salt}").as_bytes());
    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::{
        Greeting, HandshakeError, Hello, PROTOCOL_VERSION, WorkerIdentity, assert_version,
        password_hash,
    };

    fn greeting(salt: Option<&str>, iterations: Option<u32>) -> Greeting {
        Greeting {
            protocol_version: PROTOCOL_VERSION,
            salt: salt.map(str::to_owned),
            iterations,
        }
    }

    #[test]
    fn parses_hi_greeting_line() {
        let parsed = Greeting::parse(r#"HI {"v":2,"s":"abc","i":3}"#).expect("greeting parses");
        assert_eq!(parsed, greeting(Some("abc"), Some(3)));

        let bare = Greeting::parse(r#"HI {"v":2}"#).expect("greeting without salt parses");
        assert_eq!(bare.salt, None);
    }

    #[test]
    fn rejects_malformed_greeting() {
        assert!(matches!(
            Greeting::parse("OK"),
            Err(HandshakeError::MissingGreetingPrefix { .. })
        ));
        assert!(matches!(
            Greeting::parse("HI {not json"),
            Err(HandshakeError::MalformedGreeting(_))
        ));
    }

    #[test]
    fn version_assertion_only_accepts_supported_version() {
        assert!(assert_version(2).is_ok());
        assert!(matches!(
            assert_version(4),
            Err(HandshakeError::VersionMismatch {
                client: 2,
                server: 4
            })
        ));
    }

    #[test]
    fn password_hash_matches_known_vector() {
        assert_eq!(
            password_hash("abcde123", "123", 3),
            "ef646abadf4ffba660d9bbb8de8e45576970de917b4c9da8cad96b49e64636d9"
        );
    }

    #[test]
    fn password_hash_rehashes_raw_digest() {
        let iterations = 10;
        let mut expected = Sha256::digest(b"password1dozens");
        for _ in 1..iterations {
            expected = Sha256::digest(expected);
        }

        assert_eq!(
            password_hash("password1", "dozens", iterations),
            hex::encode(expected)
        );
    }

    #[test]
    fn plain_client_hello_carries_no_worker_fields() {
        let hello = Hello::build(&greeting(Some("123"), Some(3)), "box-1", None, None);

        assert_eq!(hello.hostname, "box-1");
        assert_eq!(hello.v, PROTOCOL_VERSION);
        assert!(hello.wid.is_none());
        assert!(hello.pid.is_none());
        assert!(hello.pwdhash.is_none());

        let encoded = serde_json::to_value(&hello).expect("hello serializes");
        assert_eq!(encoded, serde_json::json!({"hostname":"box-1","v":2}));
    }

    #[test]
    fn worker_hello_carries_identity_and_hash() {
        let identity = WorkerIdentity {
            wid: "workerid".to_owned(),
            labels: vec!["hippo".to_owned()],
            pid: 4242,
        };
        let hello = Hello::build(
            &greeting(Some("123"), Some(3)),
            "box-1",
            Some(&identity),
            Some("abcde123"),
        );

        assert_eq!(hello.wid.as_deref(), Some("workerid"));
        assert_eq!(hello.pid, Some(4242));
        assert_eq!(hello.labels, Some(vec!["hippo".to_owned()]));
        assert_eq!(
            hello.pwdhash.as_deref(),
            Some("ef646abadf4ffba660d9bbb8de8e45576970de917b4c9da8cad96b49e64636d9")
        );
    }

    #[test]
    fn password_without_salt_is_not_hashed() {
        let hello = Hello::build(&greeting(None, None), "box-1", None, Some("secret"));
        assert!(hello.pwdhash.is_none());
    }
}
