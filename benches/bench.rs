use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use stemma::{FastSeq, RateModel, ReconConfig, Reconstructor, Tree};

const SEED: u64 = 1293890;
const LEN: usize = 120;

fn generate_seq<R: Rng>(rng: &mut R, len: usize) -> String {
    let bases = ['A', 'C', 'G', 'T'];
    (0..len).map(|_| *bases.choose(rng).unwrap()).collect()
}

fn mutate<R: Rng>(rng: &mut R, template: &str, rate: f64) -> String {
    let bases = ['A', 'C', 'G', 'T'];
    let mut out = String::with_capacity(template.len());
    for c in template.chars() {
        let r: f64 = rng.gen();
        if r < rate {
            out.push(*bases.choose(rng).unwrap());
        } else if r < rate * 1.3 {
            // short indel
            if rng.gen() {
                out.push(c);
                out.push(*bases.choose(rng).unwrap());
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn bench_pair(c: &mut Criterion) {
    let mut rng = Xoshiro256StarStar::seed_from_u64(SEED);
    let template = generate_seq(&mut rng, LEN);
    let seqs = vec![
        FastSeq::new("x", mutate(&mut rng, &template, 0.05)),
        FastSeq::new("y", mutate(&mut rng, &template, 0.05)),
    ];
    let tree = Tree::parse_newick("(x:0.1,y:0.1)anc;").unwrap();
    let model = RateModel::dna_default();
    c.bench_function("reconstruct_pair", |b| {
        b.iter(|| {
            let rec = stemma::reconstruct(&tree, &seqs, &model).unwrap();
            black_box(rec.lp_final)
        })
    });
}

fn bench_quartet_posterior(c: &mut Criterion) {
    let mut rng = Xoshiro256StarStar::seed_from_u64(SEED + 1);
    let template = generate_seq(&mut rng, LEN);
    let seqs: Vec<FastSeq> = ["a", "b", "c", "d"]
        .iter()
        .map(|n| FastSeq::new(*n, mutate(&mut rng, &template, 0.04)))
        .collect();
    let tree = Tree::parse_newick("((a:0.1,b:0.1)ab:0.05,(c:0.1,d:0.1)cd:0.05)r;").unwrap();
    let model = RateModel::dna_default();
    let mut cfg = ReconConfig::default();
    cfg.profile_state_limit = 256;
    c.bench_function("reconstruct_quartet_posterior", |b| {
        b.iter(|| {
            let rec = Reconstructor::new(model.clone(), cfg.clone())
                .reconstruct(&tree, &seqs)
                .unwrap();
            black_box(rec.lp_final)
        })
    });
}

criterion_group!(benches, bench_pair, bench_quartet_posterior);
criterion_main!(benches);
