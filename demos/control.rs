use acmax24::{ChangeEvent, Matrix};
use std::time::Duration;

/// Small command-line controller for a matrix amplifier
///
/// ```text
/// control <host> [status]
/// control <host> route <output> <input>
/// control <host> source <output> <label>
/// control <host> volume <output> <level>
/// control <host> step <output> <delta>
/// control <host> mute <output> on|off
/// control <host> watch
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(host) = args.first() else {
        eprintln!("usage: control <host> [status|route|source|volume|step|mute|watch] ...");
        std::process::exit(2);
    };

    let matrix = Matrix::create(host)?;
    matrix.start().await?;
    if !matrix.wait_for_initial_state(Duration::from_secs(5)).await {
        return Err(format!("{} did not report its state", matrix.endpoint()).into());
    }

    let command = args.get(1).map(String::as_str).unwrap_or("status");
    let arg = |n: usize| -> Result<&str, Box<dyn std::error::Error>> {
        args.get(n)
            .map(String::as_str)
            .ok_or_else(|| format!("'{}' needs more arguments", command).into())
    };

    match command {
        "status" => print_status(&matrix),
        "route" => {
            matrix
                .change_input_for_output(arg(2)?.parse()?, arg(3)?.parse()?)
                .await?;
            print_status(&matrix);
        }
        "source" => {
            matrix.select_source(arg(2)?.parse()?, arg(3)?).await?;
            print_status(&matrix);
        }
        "volume" => {
            matrix.set_output_volume(arg(2)?.parse()?, arg(3)?.parse()?).await?;
            print_status(&matrix);
        }
        "step" => {
            matrix.step_output_volume(arg(2)?.parse()?, arg(3)?.parse()?).await?;
            print_status(&matrix);
        }
        "mute" => {
            matrix.mute_output(arg(2)?.parse()?, arg(3)? == "on").await?;
            print_status(&matrix);
        }
        "watch" => {
            print_status(&matrix);
            println!("\nWatching for changes (Ctrl-C to stop)...");
            let mut changes = matrix.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    change = changes.recv() => match change {
                        Some(ChangeEvent::Zone { index, field, old, new }) => {
                            println!("Output {} {:?}: {:?} -> {:?}", index, field, old, new);
                        }
                        Some(ChangeEvent::SourceLabel { index, old, new }) => {
                            println!("Input {} renamed: {} -> {}", index, old, new);
                        }
                        Some(ChangeEvent::Snapshot) => println!("Full state refreshed"),
                        Some(ChangeEvent::Connection(state)) => println!("Link is {}", state),
                        None => break,
                    },
                }
            }
        }
        other => return Err(format!("unknown command '{}'", other).into()),
    }

    matrix.close().await;
    Ok(())
}

fn print_status(matrix: &Matrix) {
    println!("Sources:");
    for source in matrix.get_enabled_inputs() {
        println!("  {:>2}  {}", source.index, source.label);
    }

    println!("Outputs:");
    for zone in matrix.get_enabled_outputs() {
        let source = matrix
            .zone_source(zone.index)
            .ok()
            .flatten()
            .map(|s| s.label)
            .unwrap_or_else(|| "-".to_string());
        let volume = zone
            .volume
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:>2}  {:<20} source={:<12} volume={:>3}{}",
            zone.index,
            zone.label,
            source,
            volume,
            if zone.muted { " (muted)" } else { "" }
        );
    }
}
