use std::time::Duration;

use bridge_core::EngineRegistry;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the multiplex engine-selection handshake.
pub struct Negotiated {
    /// The engine the client will talk to.
    pub engine: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("client closed the connection before negotiating")]
    ClosedEarly,
    #[error("timed out waiting for the client")]
    TimedOut,
    #[error("requested engine '{0}' is not registered")]
    UnknownEngine(String),
    #[error("no default engine is configured and none are registered")]
    NoEngineAvailable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs the `ENGINE_LIST` / `SELECT_ENGINE` negotiation on a single-port
/// connection.
///
/// Reads one line from the client. If it is exactly `ENGINE_LIST`, writes
/// the sorted engine set terminated by `ENGINES_END`, then waits for a
/// `SELECT_ENGINE <name>` reply. Any other first line selects the default
/// engine; the consumed line is discarded rather than replayed, since the
/// bridge sends its own `uci` once the session starts regardless of what
/// the client sent first.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    registry: &EngineRegistry,
) -> Result<Negotiated, NegotiationError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut first_line = String::new();
    match timeout(COMMAND_TIMEOUT, reader.read_line(&mut first_line)).await {
        Ok(Ok(0)) => return Err(NegotiationError::ClosedEarly),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(NegotiationError::TimedOut),
    }
    let first_line = first_line.trim_end().to_string();

    let default_engine = registry
        .default_engine()
        .map(|d| d.name.clone())
        .ok_or(NegotiationError::NoEngineAvailable)?;

    if first_line != "ENGINE_LIST" {
        return Ok(Negotiated { engine: default_engine });
    }

    for name in registry.sorted_names() {
        writer.write_all(format!("ENGINE {name}\n").as_bytes()).await?;
    }
    writer.write_all(b"ENGINES_END\n").await?;
    writer.flush().await?;

    let mut selection = String::new();
    match timeout(COMMAND_TIMEOUT, reader.read_line(&mut selection)).await {
        Ok(Ok(0)) => return Err(NegotiationError::ClosedEarly),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(NegotiationError::TimedOut),
    }
    let selection = selection.trim_end();

    let Some(requested) = selection.strip_prefix("SELECT_ENGINE ") else {
        return Ok(Negotiated { engine: default_engine });
    };

    if registry.get(requested).is_none() {
        writer.write_all(b"ENGINE_ERROR unknown engine\n").await?;
        writer.flush().await?;
        return Err(NegotiationError::UnknownEngine(requested.to_string()));
    }

    writer.write_all(b"ENGINE_SELECTED\n").await?;
    writer.flush().await?;

    Ok(Negotiated { engine: requested.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::BufReader;

    fn registry() -> EngineRegistry {
        EngineRegistry::new(
            [
                bridge_core::EngineDescriptor::new("alpha", "/bin/true", 1, BTreeMap::new()).unwrap(),
                bridge_core::EngineDescriptor::new("beta", "/bin/true", 2, BTreeMap::new()).unwrap(),
            ],
            Some("alpha".to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn non_engine_list_first_line_uses_default_engine() {
        let registry = registry();
        let mut reader = BufReader::new("uci\n".as_bytes());
        let mut output = Vec::new();
        let result = negotiate(&mut reader, &mut output, &registry).await.unwrap();
        assert_eq!(result.engine, "alpha");
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn engine_list_then_select_engine_switches_engine() {
        let registry = registry();
        let mut reader = BufReader::new("ENGINE_LIST\nSELECT_ENGINE beta\n".as_bytes());
        let mut output = Vec::new();
        let result = negotiate(&mut reader, &mut output, &registry).await.unwrap();
        assert_eq!(result.engine, "beta");
        let written = String::from_utf8(output).unwrap();
        assert!(written.contains("ENGINE alpha\n"));
        assert!(written.contains("ENGINE beta\n"));
        assert!(written.contains("ENGINES_END\n"));
        assert!(written.ends_with("ENGINE_SELECTED\n"));
    }

    #[tokio::test]
    async fn select_unknown_engine_is_rejected() {
        let registry = registry();
        let mut reader = BufReader::new("ENGINE_LIST\nSELECT_ENGINE gamma\n".as_bytes());
        let mut output = Vec::new();
        let err = negotiate(&mut reader, &mut output, &registry).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnknownEngine(name) if name == "gamma"));
    }

    #[tokio::test]
    async fn engine_list_then_non_select_line_falls_back_to_default() {
        let registry = registry();
        let mut reader = BufReader::new("ENGINE_LIST\nuci\n".as_bytes());
        let mut output = Vec::new();
        let result = negotiate(&mut reader, &mut output, &registry).await.unwrap();
        assert_eq!(result.engine, "alpha");
    }
}
