use semver::Version;

use crate::CNI_VERSION;
use crate::response::{Response, VersionResponse};

pub fn version() -> Response {
    Response::Version(VersionResponse {
        cni_version: CNI_VERSION,
        supported_versions: vec![
            Version::new(0, 1, 0),
            Version::new(0, 2, 0),
            Version::new(0, 3, 0),
            CNI_VERSION,
        ],
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_lists_current() {
        let Response::Version(v) = version() else {
            panic!("expected version response");
        };
        assert_eq!(v.cni_version, CNI_VERSION);
        assert!(v.supported_versions.contains(&CNI_VERSION));
    }
}
