use clap::Parser;
use core::time::Duration;
use strata::{Outlet, OutletConfig, SampleFormat, StreamInfo};

#[derive(Parser, Debug)]
#[command(name = "send_data")]
#[command(about = "Publishes a synthetic multi-channel stream", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "SendDataDemo")]
    name: String,

    #[arg(short = 't', long = "type", default_value = "EEG")]
    content_type: String,

    #[arg(short, long, default_value_t = 8)]
    channels: u32,

    /// Nominal sampling rate, in Hz
    #[arg(short, long, default_value_t = 100.)]
    rate: f64,

    /// Samples per push
    #[arg(long, default_value_t = 10)]
    chunk: usize,

    #[arg(long, default_value = "send-data-demo")]
    source_id: String,
}

fn main() -> strata::Result<()> {
    env_logger::init();

    let args = Args::parse();

    if args.rate <= 0. || args.chunk == 0 {
        return Err(strata::Error::InvalidArgument(
            "rate and chunk size must be positive".into(),
        ));
    }

    let mut info = StreamInfo::new(
        &args.name,
        &args.content_type,
        args.channels,
        args.rate,
        SampleFormat::Float32,
        &args.source_id,
    )?;

    let channels = info.desc_mut().append_child("channels");
    for i in 0..args.channels {
        channels
            .append_child("channel")
            .append_child_value("label", format!("Ch{}", i + 1))
            .append_child_value("unit", "microvolts");
    }

    let outlet = Outlet::new(info, OutletConfig::default())?;
    println!("publishing {} ({})", outlet.info().name(), outlet.info().uid());

    let period = args.chunk as f64 / args.rate;
    let mut n = 0u64;

    loop {
        let chunk: Vec<Vec<f32>> = (0..args.chunk)
            .map(|_| {
                n += 1;
                (0..args.channels)
                    .map(|c| ((n as f64 / args.rate + c as f64).sin()) as f32)
                    .collect()
            })
            .collect();

        outlet.push_chunk(&chunk, None, true)?;

        std::thread::sleep(Duration::from_secs_f64(period));
    }
}
