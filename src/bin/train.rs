use std::env;
use std::fs;
use std::process;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tiered_lstm::memory::new_session_id;
use tiered_lstm::training::create_adam_trainer;
use tiered_lstm::{
    BatchIndex, Config, CpuEngine, LstmModel, MathEngine, PersistentStore, Result, TextVocabulary, TrainingLog,
    Vocabulary,
};

const SAMPLE_LENGTH: usize = 80;
const SAMPLE_TEMPERATURE: f32 = 0.8;

fn run(config_path: &str, corpus_path: &str) -> Result<()> {
    let mut config = Config::from_json_file(config_path)?;
    let text = fs::read_to_string(corpus_path)?;

    // Build the character vocabulary from the corpus
    let vocab = TextVocabulary::from_text(&text);
    config.model.vocab_size = vocab.size();
    fs::create_dir_all(&config.work_dir)?;
    vocab.save(config.work_dir.join("vocab.json"))?;
    println!("Vocabulary size: {}", vocab.size());

    let session = new_session_id();
    let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
    let store = Arc::new(PersistentStore::open(Arc::clone(&engine), &config.work_dir, &session)?);
    let model = LstmModel::initialize(config.model.clone(), store, config.training.seed)?;

    let sequences = BatchIndex::split_tokens(&vocab.encode(&text), config.training.sequence_length);
    let batches = BatchIndex::from_sequences(&config.work_dir, &session, &sequences, config.training.batch_size)?;
    println!("Training on {} sequences in {} batches", sequences.len(), batches.len());

    let log = TrainingLog::open(config.work_dir.join("training.log"))?;
    let mut trainer = create_adam_trainer(config.clone(), model).with_log(log);
    for metrics in trainer.train(&batches)? {
        println!(
            "Epoch {}: Train Loss: {:.6}, Grad Norm: {:.4}, LR: {:.6}, Failed: {}, Time: {:.2}s",
            metrics.epoch,
            metrics.train_loss,
            metrics.grad_norm,
            metrics.learning_rate,
            metrics.failed_batches,
            metrics.time_elapsed
        );
    }

    // Sample a continuation of the corpus opening
    let prompt: Vec<usize> = vocab.encode(&text).into_iter().take(8).collect();
    let mut scope = trainer.open_scope("sample");
    let weights = trainer.model().load_weights(&mut scope)?;
    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let generated = trainer
        .pipeline()
        .generate(&mut scope, &weights, &prompt, SAMPLE_LENGTH, SAMPLE_TEMPERATURE, &mut rng)?;
    println!("Generated text: {}{}", vocab.decode(&prompt), vocab.decode(&generated));
    println!("Model saved under {}", config.checkpoint_dir().display());

    batches.dispose();
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <config.json> <corpus.txt>", args[0]);
        process::exit(2);
    }
    if let Err(e) = run(&args[1], &args[2]) {
        eprintln!("training failed: {}", e);
        process::exit(1);
    }
}
