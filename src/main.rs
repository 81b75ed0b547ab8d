use rand::SeedableRng;
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use std::env;
use streaming_neox::{
    AttentionStrategy, NeoXConfig, NeoXModel, NeoXWeights, StreamingConfig, StreamingSession,
    Tensor, load_model, save_model,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <checkpoint|--random> [options]", args[0]);
        eprintln!("Options:");
        eprintln!("  --steps <int>          Tokens to stream (default: 256)");
        eprintln!("  --start <int>          Attention sink slots (default: 4)");
        eprintln!("  --recent <int>         Recent slots kept (default: 2000)");
        eprintln!("  --seed <int>           Random seed (default: 0)");
        eprintln!("  --save <path>          Write the loaded/random model as a checkpoint");
        eprintln!("  --default-attention    Keep absolute-position rotary attention");
        std::process::exit(1);
    }

    let source = &args[1];

    // Parse optional arguments
    let mut steps = 256usize;
    let mut streaming = StreamingConfig::default();
    let mut seed = 0u64;
    let mut save: Option<String> = None;
    let mut strategy = AttentionStrategy::PositionShifted;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--steps" => {
                steps = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(256);
                i += 2;
            }
            "--start" => {
                streaming.start_size = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(4);
                i += 2;
            }
            "--recent" => {
                streaming.recent_size =
                    args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(2000);
                i += 2;
            }
            "--seed" => {
                seed = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            "--save" => {
                save = args.get(i + 1).cloned();
                i += 2;
            }
            "--default-attention" => {
                strategy = AttentionStrategy::Default;
                i += 1;
            }
            _ => i += 1,
        }
    }

    // Load or initialize the model
    let (config, weights) = if source == "--random" {
        tracing::info!(seed, "initializing random model");
        let config = NeoXConfig::default();
        (config, NeoXWeights::random(&config, seed)?)
    } else {
        tracing::info!(path = %source, "loading model");
        load_model(source)?
    };
    tracing::info!(
        hidden = config.hidden_size,
        layers = config.num_hidden_layers,
        heads = config.num_attention_heads,
        rotary_ndims = config.rotary_ndims(),
        "config"
    );

    if let Some(path) = save {
        save_model(&path, &config, &weights)?;
        tracing::info!(path = %path, "saved checkpoint");
    }

    let model = NeoXModel::new(config, weights, strategy)?;
    let mut session = StreamingSession::new(streaming)?;
    tracing::info!(
        ?strategy,
        start = streaming.start_size,
        recent = streaming.recent_size,
        "streaming"
    );

    // Stream random hidden states token by token
    let hidden = config.hidden_size as usize;
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let dist = Uniform::new_inclusive(-1.0f32, 1.0)?;

    for step in 0..steps {
        let data: Vec<f32> = (0..hidden).map(|_| dist.sample(&mut rng)).collect();
        let token = Tensor::new(data, &[1, 1, hidden])?;
        let out = session.step(&model, &token)?;
        tracing::info!(
            step,
            cache_len = session.cache_len(),
            norm = out.norm(),
            "token"
        );
    }

    println!(
        "streamed {} tokens with {} resident cache slots",
        session.tokens_seen(),
        session.cache_len()
    );
    Ok(())
}
