//! Tunnel argument parsing
//!
//! Accepted forms, comma separated:
//! - `8080:9090` single port pair (listens on localhost)
//! - `8000-8010:9000-9010` equal-length port ranges
//! - `SSH_AUTH_SOCK:/tmp/agent.sock` environment variable pipe forward
//! - `localhost:8888:[::1]:9999` ssh-style `host:port:host:port`

use crate::{SocketEndpoint, SourceRequest, DEFAULT_HOST};
use thiserror::Error;

/// Tunnel argument errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelParseError {
    #[error("Tunnel argument must have source and destination between a ':'")]
    MissingSeparator,

    #[error("source/destination port range must have same length")]
    RangeLengthMismatch,

    #[error(
        "Invalid port range syntax: if source is a range, destination must be a range (and vice versa)"
    )]
    UnpairedRange,

    #[error("The 4 part ssh-style tunneling arg must look like host:port:host:port, got '{0}'")]
    SshPartCount(String),

    #[error("Ipv6 addresses must be inside of square brackets: '{0}'")]
    UnbracketedIpv6(String),

    #[error("Invalid tunnel argument '{input}': {reason}")]
    InvalidArgument { input: String, reason: String },
}

/// Parse a tunnel argument into source registration requests
pub fn parse_ranges_to_requests(input: &str) -> Result<Vec<SourceRequest>, TunnelParseError> {
    let mut requests = Vec::new();

    for entry in input.split(',') {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() < 2 {
            return Err(TunnelParseError::MissingSeparator);
        }

        if parts.len() > 2 || entry.contains('[') {
            let ssh_parts = parse_ssh_tunnel_arg(entry)?;
            let source_port = parse_port(&ssh_parts[1], input)?;
            let destination_port = parse_port(&ssh_parts[3], input)?;
            requests.push(SourceRequest::new(
                SocketEndpoint::tcp(ssh_parts[0].as_str(), source_port),
                SocketEndpoint::tcp(ssh_parts[2].as_str(), destination_port),
            ));
            continue;
        }

        let (source, destination) = (parts[0], parts[1]);
        if !is_port_spec(source) && !is_port_spec(destination) {
            requests.push(SourceRequest::environment(
                source,
                SocketEndpoint::pipe(destination),
            ));
        } else if source.contains('-') && destination.contains('-') {
            let (source_start, source_end) = parse_range(source, input)?;
            let (destination_start, destination_end) = parse_range(destination, input)?;
            if source_end - source_start != destination_end - destination_start {
                return Err(TunnelParseError::RangeLengthMismatch);
            }
            for offset in 0..=(source_end - source_start) {
                requests.push(SourceRequest::new(
                    SocketEndpoint::tcp(DEFAULT_HOST, source_start + offset),
                    SocketEndpoint::port(destination_start + offset),
                ));
            }
        } else if source.contains('-') || destination.contains('-') {
            return Err(TunnelParseError::UnpairedRange);
        } else {
            requests.push(SourceRequest::new(
                SocketEndpoint::tcp(DEFAULT_HOST, parse_port(source, input)?),
                SocketEndpoint::port(parse_port(destination, input)?),
            ));
        }
    }

    Ok(requests)
}

/// Split an ssh-style `host:port:host:port` argument
///
/// IPv6 hosts must be wrapped in square brackets; the brackets are stripped
/// from the returned parts.
pub fn parse_ssh_tunnel_arg(input: &str) -> Result<Vec<String>, TunnelParseError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;

    for c in input.chars() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            ':' if !in_brackets => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_brackets {
        return Err(TunnelParseError::InvalidArgument {
            input: input.to_string(),
            reason: "unterminated '['".to_string(),
        });
    }
    parts.push(current);

    if parts.len() > 4 {
        return Err(TunnelParseError::UnbracketedIpv6(input.to_string()));
    }
    if parts.len() != 4 || parts.iter().any(|part| part.is_empty()) {
        return Err(TunnelParseError::SshPartCount(input.to_string()));
    }
    Ok(parts)
}

fn is_port_spec(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_digit() || c == '-')
}

fn parse_port(value: &str, input: &str) -> Result<u16, TunnelParseError> {
    value
        .parse::<u16>()
        .map_err(|e| TunnelParseError::InvalidArgument {
            input: input.to_string(),
            reason: format!("'{}' is not a port: {}", value, e),
        })
}

fn parse_range(value: &str, input: &str) -> Result<(u16, u16), TunnelParseError> {
    let bounds: Vec<&str> = value.split('-').collect();
    if bounds.len() != 2 {
        return Err(TunnelParseError::InvalidArgument {
            input: input.to_string(),
            reason: format!("'{}' is not a port range", value),
        });
    }
    let start = parse_port(bounds[0], input)?;
    let end = parse_port(bounds[1], input)?;
    if end < start {
        return Err(TunnelParseError::InvalidArgument {
            input: input.to_string(),
            reason: format!("range '{}' ends before it starts", value),
        });
    }
    Ok((start, end))
}
