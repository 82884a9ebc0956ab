use clap::Parser;
use core::time::Duration;
use strata::{FOREVER, Inlet, InletConfig, Postprocessing};

#[derive(Parser, Debug)]
#[command(name = "receive_data")]
#[command(about = "Prints the samples of a float32 stream", long_about = None)]
struct Args {
    /// Predicate selecting the stream, e.g. "type='EEG'"
    #[arg(short, long, default_value = "type='EEG'")]
    predicate: String,

    /// Map timestamps onto the local clock
    #[arg(long)]
    sync: bool,

    /// Stop after this many samples
    #[arg(long)]
    count: Option<usize>,
}

fn main() -> strata::Result<()> {
    env_logger::init();

    let args = Args::parse();

    println!("looking for a stream matching {}", args.predicate);
    let info = strata::resolve_first(&args.predicate, FOREVER)?;

    let inlet = Inlet::new(
        &info,
        InletConfig {
            postprocessing: Postprocessing {
                clock_sync: args.sync,
                monotonize: args.sync,
            },
            ..Default::default()
        },
    )?;

    let full = inlet.info(Some(Duration::from_secs(5)))?;
    println!("{}", full.to_xml());

    let mut received = 0;

    while args.count.is_none_or(|c| received < c) {
        for sample in inlet.pull_chunk::<f32>(FOREVER)? {
            println!("{:.6}\t{:?}", sample.timestamp, sample.values);
            received += 1;
        }
    }

    println!(
        "received {received} samples, {} dropped",
        inlet.dropped_samples()
    );

    Ok(())
}
