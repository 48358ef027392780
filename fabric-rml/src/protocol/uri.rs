//! Contact URIs exchanged out of band: `"<jobid>.<vpid>;ofi://<hex endpoint name>"`.

use crate::error::{Result, RmlError};
use crate::fabric::EndpointName;
use crate::types::ProcessName;

const SCHEME: &str = "ofi://";

/// Format the contact URI for `name` reachable at `addr`.
pub fn format_uri(name: &ProcessName, addr: &EndpointName) -> String {
    format!(
        "{}.{};{SCHEME}{}",
        name.jobid,
        name.vpid,
        hex::encode(addr.as_bytes())
    )
}

/// Parse a contact URI into the process name and endpoint address it advertises.
pub fn parse_uri(uri: &str) -> Result<(ProcessName, EndpointName)> {
    let (proc_part, addr_part) = uri
        .split_once(';')
        .ok_or_else(|| RmlError::InvalidUri(format!("missing ';' in {uri:?}")))?;
    let (jobid, vpid) = proc_part
        .split_once('.')
        .ok_or_else(|| RmlError::InvalidUri(format!("missing '.' in {proc_part:?}")))?;
    let jobid = jobid
        .parse()
        .map_err(|_| RmlError::InvalidUri(format!("bad jobid {jobid:?}")))?;
    let vpid = vpid
        .parse()
        .map_err(|_| RmlError::InvalidUri(format!("bad vpid {vpid:?}")))?;
    let encoded = addr_part
        .strip_prefix(SCHEME)
        .ok_or_else(|| RmlError::InvalidUri(format!("expected {SCHEME} in {addr_part:?}")))?;
    let bytes = hex::decode(encoded)
        .map_err(|e| RmlError::InvalidUri(format!("bad endpoint address: {e}")))?;
    Ok((ProcessName::new(jobid, vpid), EndpointName::new(bytes)?))
}
