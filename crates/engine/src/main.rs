use anyhow::Result;
use blockgate_common::{init_tracing, Decision, EngineConfig, LogFormat, RequestRecord};
use blockgate_engine::BlockingEngine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

/// Reads newline-delimited JSON request records on stdin and writes one JSON
/// decision per line on stdout.
#[tokio::main]
async fn main() -> Result<()> {
    let format = match std::env::var("BLOCKGATE_LOG_FORMAT").as_deref() {
        Ok("text") => LogFormat::Text,
        _ => LogFormat::Json,
    };
    init_tracing(format)?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/blockgate.yaml".to_string());

    info!(config_path = %config_path, "starting blocking engine");

    let config = if std::path::Path::new(&config_path).exists() {
        EngineConfig::load(&config_path)?
    } else {
        warn!(config_path = %config_path, "config file not found, using defaults");
        EngineConfig::default()
    };

    let engine = BlockingEngine::from_config(config).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let served = serve(&engine, &mut stdin, &mut stdout).await;
    if let Err(ref e) = served {
        error!(error = %e, "request stream failed, shutting down");
    }

    let stats = engine.stats();
    info!(allowed = stats.allowed, blocked = stats.blocked, "shutting down");
    engine.shutdown().await;
    served
}

/// Answer every non-blank input line until end of input or Ctrl-C. Only I/O
/// errors on the streams themselves end the loop early.
async fn serve<R, W>(engine: &BlockingEngine, input: &mut R, output: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = input.read_until(b'\n', &mut line) => read?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        };
        if read == 0 {
            break;
        }

        let decision = match decode(&line) {
            Decoded::Blank => continue,
            Decoded::Record(request) => engine.evaluate(&request).await,
            Decoded::Malformed(reason) => engine.reject_malformed(reason),
        };
        write_decision(output, &decision).await?;
    }
    output.flush().await?;
    Ok(())
}

enum Decoded {
    Blank,
    Record(RequestRecord),
    Malformed(String),
}

fn decode(line: &[u8]) -> Decoded {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Decoded::Malformed(format!("request line is not valid UTF-8: {}", e)),
    };
    if text.is_empty() {
        return Decoded::Blank;
    }
    match serde_json::from_str(text) {
        Ok(request) => Decoded::Record(request),
        Err(e) => Decoded::Malformed(format!("unparseable request record: {}", e)),
    }
}

async fn write_decision<W: AsyncWrite + Unpin>(output: &mut W, decision: &Decision) -> Result<()> {
    let mut out = serde_json::to_vec(decision)?;
    out.push(b'\n');
    output.write_all(&out).await?;
    Ok(())
}
