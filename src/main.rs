use clap::{App, Arg};
use std::io::BufWriter;
use stemma::envelope::DiagEnvParams;
use stemma::{fasta, RateModel, ReconConfig, Reconstructor, Tree};

fn main() -> stemma::Result<()> {
    let matches = App::new("stemma")
        .version("0.1.0")
        .about("Ancestral sequence reconstruction with profile pair-HMMs.")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Debug mode"),
        )
        .arg(
            Arg::with_name("seqs")
                .long("seqs")
                .short("s")
                .value_name("FASTA")
                .takes_value(true)
                .required(true)
                .help("Leaf sequences. FASTA format."),
        )
        .arg(
            Arg::with_name("tree")
                .long("tree")
                .short("t")
                .value_name("NEWICK")
                .takes_value(true)
                .required(true)
                .help("Rooted binary tree with branch lengths. Newick format."),
        )
        .arg(
            Arg::with_name("model")
                .long("model")
                .value_name("JSON")
                .takes_value(true)
                .help("Rate model. Defaults to single-component Jukes-Cantor."),
        )
        .arg(
            Arg::with_name("output")
                .long("output")
                .short("o")
                .value_name("FASTA")
                .takes_value(true)
                .help("Write the gapped alignment here instead of stdout."),
        )
        .arg(
            Arg::with_name("save_profile")
                .long("save-profile")
                .value_name("JSON")
                .takes_value(true)
                .help("Write the root profile as JSON."),
        )
        .arg(
            Arg::with_name("samples")
                .long("samples")
                .takes_value(true)
                .default_value("100")
                .help("Stochastic tracebacks per internal node (sampled profiles)."),
        )
        .arg(
            Arg::with_name("states")
                .long("states")
                .takes_value(true)
                .default_value("0")
                .help("Cap on profile states per node. 0 means unlimited."),
        )
        .arg(
            Arg::with_name("post")
                .long("post")
                .takes_value(true)
                .default_value("0.01")
                .help("Posterior probability cutoff for profile states."),
        )
        .arg(
            Arg::with_name("nopost")
                .long("nopost")
                .help("Use sampled profiles instead of posterior-pruned ones."),
        )
        .arg(
            Arg::with_name("guide_band")
                .long("guide-band")
                .takes_value(true)
                .default_value("10")
                .help("Initial guide-alignment band. Negative disables the guide."),
        )
        .arg(
            Arg::with_name("kmatch")
                .long("kmatch")
                .takes_value(true)
                .help("K-mer length for envelope seeding (5-32)."),
        )
        .arg(
            Arg::with_name("kmatchn")
                .long("kmatchn")
                .takes_value(true)
                .help("K-mer match threshold for seeding a diagonal."),
        )
        .arg(
            Arg::with_name("kmatchband")
                .long("kmatchband")
                .takes_value(true)
                .help("Band width around each seeded diagonal."),
        )
        .arg(
            Arg::with_name("kmatchmb")
                .long("kmatchmb")
                .takes_value(true)
                .help("Memory budget in MB; picks the k-mer threshold automatically."),
        )
        .arg(
            Arg::with_name("kmatchoff")
                .long("kmatchoff")
                .help("Disable the sparse envelope (full DP)."),
        )
        .arg(
            Arg::with_name("counts")
                .long("counts")
                .help("Accumulate expected substitution and indel counts."),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("5489")
                .help("Seed"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let seqs = fasta::read_fasta(&matches.value_of("seqs").map(String::from))?;
    let newick = std::fs::read_to_string(matches.value_of("tree").unwrap())?;
    let tree = Tree::parse_newick(&newick)?;
    let model = match matches.value_of("model") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RateModel::dna_default(),
    };

    let mut env_params = DiagEnvParams::default();
    if let Some(k) = matches.value_of("kmatch") {
        env_params.kmer_len = parse(k, "kmatch")?;
    }
    if let Some(n) = matches.value_of("kmatchn") {
        env_params.kmer_threshold = parse(n, "kmatchn")?;
    }
    if let Some(b) = matches.value_of("kmatchband") {
        env_params.band_size = parse(b, "kmatchband")?;
    }
    if let Some(mb) = matches.value_of("kmatchmb") {
        env_params.max_size = parse::<usize>(mb, "kmatchmb")? << 20;
        env_params.kmer_threshold = -1;
    }
    if matches.is_present("kmatchoff") {
        env_params.sparse = false;
    }

    let config = ReconConfig {
        profile_samples: parse(matches.value_of("samples").unwrap(), "samples")?,
        profile_state_limit: parse(matches.value_of("states").unwrap(), "states")?,
        min_post_prob: parse(matches.value_of("post").unwrap(), "post")?,
        use_posteriors: !matches.is_present("nopost"),
        accumulate_subst_counts: matches.is_present("counts"),
        accumulate_indel_counts: matches.is_present("counts"),
        max_dist_from_guide: parse(matches.value_of("guide_band").unwrap(), "guide-band")?,
        env_params,
        seed: parse(matches.value_of("seed").unwrap(), "seed")?,
        ..ReconConfig::default()
    };

    let recon = Reconstructor::new(model, config).reconstruct(&tree, &seqs)?;
    let gapped = recon.alignment.gapped();
    match matches.value_of("output") {
        Some(path) => {
            let mut wtr = BufWriter::new(std::fs::File::create(path)?);
            fasta::write_fasta(&mut wtr, &gapped)?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut wtr = BufWriter::new(stdout.lock());
            fasta::write_fasta(&mut wtr, &gapped)?;
        }
    }
    if let Some(path) = matches.value_of("save_profile") {
        std::fs::write(path, recon.root_profile.to_json())?;
    }
    if let Some(counts) = &recon.counts {
        eprintln!("{}", serde_json::to_string_pretty(counts)?);
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(value: &str, flag: &str) -> stemma::Result<T> {
    value
        .parse()
        .map_err(|_| stemma::Error::Config(format!("bad value {:?} for --{}", value, flag)))
}
