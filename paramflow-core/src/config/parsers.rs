use anyhow::{bail, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;

/// Decode a config payload according to its (lowercased) file extension.
pub(crate) fn parse<T: DeserializeOwned>(extension: &str, raw: &Bytes) -> Result<T> {
    match extension {
        "json" => Ok(serde_json::from_slice(raw)?),
        "toml" => Ok(toml::from_str(std::str::from_utf8(raw)?)?),
        other => bail!("no parser available for config format {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::parse;

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = parse::<serde_json::Value>("yaml", &Bytes::from_static(b"a: 1")).unwrap_err();
        assert!(err.to_string().contains("no parser available"));
    }
}
