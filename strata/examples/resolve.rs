use clap::Parser;
use core::time::Duration;
use strata::ContinuousResolver;

#[derive(Parser, Debug)]
#[command(name = "resolve")]
#[command(about = "Lists the streams visible on the network", long_about = None)]
struct Args {
    /// Only list the streams satisfying this predicate
    #[arg(short, long)]
    predicate: Option<String>,

    /// Keep listing, refreshing every second
    #[arg(short, long)]
    watch: bool,

    /// Seconds to wait for streams to answer
    #[arg(long, default_value_t = 1.)]
    wait: f64,
}

fn print(streams: &[strata::StreamInfo]) {
    for info in streams {
        println!(
            "{:<24} {:<12} {:>4} ch {:>9} Hz {:<9} {} @ {}",
            info.name(),
            info.content_type(),
            info.channel_count(),
            info.nominal_rate(),
            info.format().as_str(),
            info.uid(),
            info.hostname()
        );
    }
}

fn main() -> strata::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let wait = Duration::try_from_secs_f64(args.wait)
        .map_err(|e| strata::Error::InvalidArgument(e.to_string()))?;

    if args.watch {
        let forget_after = wait.max(Duration::from_secs(1));

        let resolver = match &args.predicate {
            Some(p) => ContinuousResolver::by_predicate(p, forget_after)?,
            None => ContinuousResolver::all(forget_after)?,
        };

        loop {
            std::thread::sleep(Duration::from_secs(1));
            println!("--");
            print(&resolver.results());
        }
    }

    let streams = match &args.predicate {
        Some(p) => strata::resolve_by_predicate(p, 0, Some(wait))?,
        None => strata::resolve_all(Some(wait))?,
    };

    print(&streams);

    Ok(())
}
