//! Hidden-service configuration records.
//!
//! Hidden services are configured through a group of related options
//! (`HiddenServiceDir`, `HiddenServicePort`, `HiddenServiceVersion`,
//! `HiddenServiceAuthorizeClient`) whose grouping is positional: a new
//! `HiddenServiceDir` line starts a new service.  We mirror each group
//! as a [`HiddenService`] value owned by the config.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::err::ConfigError;

/// Shared flag a config hands to the services it owns, so that mutating
/// a service marks the whole group as needing a save.
pub(crate) type HsDirty = Arc<AtomicBool>;

/// One hidden service's configuration.
///
/// Tor materializes a `hostname` and `private_key` file inside the
/// service directory once the service is created; those are exposed as
/// lazily-read accessors.
#[derive(Clone, Debug, Default)]
pub struct HiddenService {
    /// The service directory (`HiddenServiceDir`).
    dir: String,
    /// One entry per `HiddenServicePort` line, e.g. `"80 127.0.0.1:8080"`.
    ports: Vec<String>,
    /// The service descriptor version (`HiddenServiceVersion`), if set.
    version: Option<u32>,
    /// Client authorization (`HiddenServiceAuthorizeClient`), if set.
    authorize_client: Option<String>,
    /// Cached contents of `<dir>/hostname`.
    hostname: Option<String>,
    /// Cached contents of `<dir>/private_key`.
    private_key: Option<String>,
    /// Set when any field changes, if this service is owned by a config.
    dirty: Option<HsDirty>,
}

impl HiddenService {
    /// Create a hidden service rooted at `dir`, forwarding each entry of
    /// `ports` as a `HiddenServicePort` line.
    pub fn new<S: Into<String>>(dir: S, ports: Vec<String>) -> Self {
        HiddenService {
            dir: dir.into(),
            ports,
            ..HiddenService::default()
        }
    }

    /// Builder-style: set the descriptor version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Builder-style: set client authorization.
    pub fn with_authorize_client<S: Into<String>>(mut self, auth: S) -> Self {
        self.authorize_client = Some(auth.into());
        self
    }

    /// Attach this service to its owning config's dirty flag.
    pub(crate) fn attach(&mut self, dirty: HsDirty) {
        self.dirty = Some(dirty);
    }

    /// Mark the owning config (if any) as needing a save.
    fn mark(&self) {
        if let Some(dirty) = &self.dirty {
            dirty.store(true, Ordering::Relaxed);
        }
    }

    /// The service directory.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// The configured port lines.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// The descriptor version, if configured.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// The client-authorization setting, if configured.
    pub fn authorize_client(&self) -> Option<&str> {
        self.authorize_client.as_deref()
    }

    /// Change the service directory.
    pub fn set_dir<S: Into<String>>(&mut self, dir: S) {
        self.dir = dir.into();
        self.hostname = None;
        self.private_key = None;
        self.mark();
    }

    /// Append a `HiddenServicePort` line.
    pub fn add_port<S: Into<String>>(&mut self, port: S) {
        self.ports.push(port.into());
        self.mark();
    }

    /// Replace the port lines wholesale.
    pub fn set_ports(&mut self, ports: Vec<String>) {
        self.ports = ports;
        self.mark();
    }

    /// Remove the port line at `index`, if it exists.
    pub fn remove_port(&mut self, index: usize) {
        if index < self.ports.len() {
            self.ports.remove(index);
            self.mark();
        }
    }

    /// Set the descriptor version.
    pub fn set_version(&mut self, version: Option<u32>) {
        self.version = version;
        self.mark();
    }

    /// Set client authorization.
    pub fn set_authorize_client(&mut self, auth: Option<String>) {
        self.authorize_client = auth;
        self.mark();
    }

    /// The service's onion hostname, read from `<dir>/hostname` on first
    /// access.
    ///
    /// Tor creates the file once the service configuration has been
    /// accepted, so this can fail with NotFound before the first
    /// successful save.
    pub fn hostname(&mut self) -> std::io::Result<&str> {
        if self.hostname.is_none() {
            self.hostname = Some(read_service_file(&self.dir, "hostname")?);
        }
        Ok(self.hostname.as_deref().unwrap_or_default())
    }

    /// The service's private key, read from `<dir>/private_key` on first
    /// access.
    pub fn private_key(&mut self) -> std::io::Result<&str> {
        if self.private_key.is_none() {
            self.private_key = Some(read_service_file(&self.dir, "private_key")?);
        }
        Ok(self.private_key.as_deref().unwrap_or_default())
    }

    /// The ordered `(key, value)` pairs this service contributes to a
    /// SETCONF batch or a torrc file.
    pub(crate) fn config_attributes(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![("HiddenServiceDir", self.dir.clone())];
        for port in &self.ports {
            out.push(("HiddenServicePort", port.clone()));
        }
        if let Some(version) = self.version {
            out.push(("HiddenServiceVersion", version.to_string()));
        }
        if let Some(auth) = &self.authorize_client {
            out.push(("HiddenServiceAuthorizeClient", auth.clone()));
        }
        out
    }
}

/// Read and trim one of the files Tor leaves in a service directory.
fn read_service_file(dir: &str, name: &str) -> std::io::Result<String> {
    let path = Path::new(dir).join(name);
    Ok(std::fs::read_to_string(path)?.trim().to_owned())
}

/// Parse the reply lines of `GETCONF HiddenServiceOptions` into service
/// records.  A reappearing `HiddenServiceDir` starts the next record.
pub(crate) fn parse_hidden_service_options<'a, I>(
    lines: I,
) -> Result<Vec<HiddenService>, ConfigError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut services = Vec::new();
    let mut current: Option<HiddenService> = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::Bootstrap(format!("bad HiddenServiceOptions line {:?}", line)))?;
        match key {
            "HiddenServiceDir" => {
                if let Some(done) = current.take() {
                    services.push(done);
                }
                current = Some(HiddenService::new(value, Vec::new()));
            }
            "HiddenServicePort" => match &mut current {
                Some(hs) => hs.ports.push(value.to_owned()),
                None => {
                    return Err(ConfigError::Bootstrap(
                        "HiddenServicePort before any HiddenServiceDir".into(),
                    ));
                }
            },
            "HiddenServiceVersion" => match &mut current {
                Some(hs) => {
                    hs.version = Some(value.parse().map_err(|_| {
                        ConfigError::Bootstrap(format!("bad HiddenServiceVersion {:?}", value))
                    })?);
                }
                None => {
                    return Err(ConfigError::Bootstrap(
                        "HiddenServiceVersion before any HiddenServiceDir".into(),
                    ));
                }
            },
            "HiddenServiceAuthorizeClient" => match &mut current {
                Some(hs) => hs.authorize_client = Some(value.to_owned()),
                None => {
                    return Err(ConfigError::Bootstrap(
                        "HiddenServiceAuthorizeClient before any HiddenServiceDir".into(),
                    ));
                }
            },
            other => {
                return Err(ConfigError::Bootstrap(format!(
                    "unexpected HiddenServiceOptions key {:?}",
                    other
                )));
            }
        }
    }
    if let Some(done) = current.take() {
        services.push(done);
    }
    Ok(services)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn parse_two_services() {
        let lines = [
            "HiddenServiceDir=/a",
            "HiddenServicePort=80 127.0.0.1:1234",
            "HiddenServiceVersion=2",
            "HiddenServiceDir=/b",
            "HiddenServicePort=8080 127.0.0.1:9999",
            "HiddenServicePort=443 127.0.0.1:443",
            "HiddenServiceVersion=2",
            "HiddenServiceAuthorizeClient=stealth foo",
        ];
        let services = parse_hidden_service_options(lines).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].dir(), "/a");
        assert_eq!(services[0].ports(), ["80 127.0.0.1:1234"]);
        assert_eq!(services[0].version(), Some(2));
        assert_eq!(services[0].authorize_client(), None);
        assert_eq!(services[1].dir(), "/b");
        assert_eq!(services[1].ports().len(), 2);
        assert_eq!(services[1].authorize_client(), Some("stealth foo"));
    }

    #[test]
    fn parse_rejects_orphan_lines() {
        let err = parse_hidden_service_options(["HiddenServicePort=80"]).unwrap_err();
        assert!(matches!(err, ConfigError::Bootstrap(_)));
    }

    #[test]
    fn mutation_marks_owner_dirty() {
        let dirty: HsDirty = Arc::new(AtomicBool::new(false));
        let mut hs = HiddenService::new("/a", vec!["80 127.0.0.1:80".into()]);
        hs.attach(Arc::clone(&dirty));
        assert!(!dirty.load(Ordering::Relaxed));
        hs.add_port("443 127.0.0.1:443");
        assert!(dirty.load(Ordering::Relaxed));

        dirty.store(false, Ordering::Relaxed);
        hs.set_version(Some(2));
        assert!(dirty.load(Ordering::Relaxed));
    }

    #[test]
    fn config_attribute_order() {
        let hs = HiddenService::new("/b", vec!["8080 127.0.0.1:9999".into(), "443 127.0.0.1:443".into()])
            .with_version(2)
            .with_authorize_client("stealth foo");
        let attrs = hs.config_attributes();
        let keys: Vec<&str> = attrs.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            [
                "HiddenServiceDir",
                "HiddenServicePort",
                "HiddenServicePort",
                "HiddenServiceVersion",
                "HiddenServiceAuthorizeClient"
            ]
        );
    }

    #[test]
    fn lazy_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hostname"), "abcdef.onion\n").unwrap();
        let mut hs = HiddenService::new(dir.path().to_string_lossy(), vec![]);
        assert_eq!(hs.hostname().unwrap(), "abcdef.onion");
        // Missing private_key surfaces as an io error.
        assert!(hs.private_key().is_err());
    }
}
