use std::env;
use std::io::{self, Write};
use std::sync::Arc;

use storychain::clients::openai::OpenAIClient;
use storychain::config::PipelineConfig;
use storychain::input::{
    compose_seed, normalize_text, read_story_lines, read_text_file, END_SENTINEL,
};
use storychain::run::{RunController, RunStatus};

// Run from the root folder of the repo as follows:
// OPENAI_API_KEY=your-key cargo run --example story_pipeline -- config/story_pipeline.json [story.txt] [mvp.txt]
//
// Without a story file the user story is read from stdin until a line with END.
// Press Ctrl-C once to stop the run after the current agent finishes.

#[tokio::main]
async fn main() {
    storychain::init_logger();

    let mut args = env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "config/story_pipeline.json".to_string());
    let story_path = args.next();
    let mvp_path = args.next();

    let config = match PipelineConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    let story = match story_path {
        Some(path) => read_text_file(&path).unwrap_or_else(|err| {
            eprintln!("An error occurred while reading '{}': {}", path, err);
            std::process::exit(1);
        }),
        None => {
            println!(
                "Enter the User story. When you're done, input \"{}\" or EOF (End Of File) \
                 to finish:",
                END_SENTINEL
            );
            let stdin = io::stdin();
            let lines = read_story_lines(stdin.lock()).expect("Failed to read the user story");
            normalize_text(&lines)
        }
    };
    let mvp = mvp_path.map(|path| {
        read_text_file(&path).unwrap_or_else(|err| {
            eprintln!("An error occurred while reading '{}': {}", path, err);
            std::process::exit(1);
        })
    });
    let seed = compose_seed(&story, mvp.as_deref());
    println!("Successfully read task\n");

    let secret_key =
        env::var("OPENAI_API_KEY").expect("Please set the OPENAI_API_KEY environment variable!");
    let client = OpenAIClient::new(&secret_key).expect("Failed to build the OpenAI client");
    let controller = RunController::new(Arc::new(client));

    let mut handle = controller
        .start(config, seed)
        .expect("Failed to start the pipeline");
    let cancel = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current agent...");
            cancel.cancel();
        }
    });

    while let Some(message) = handle.next_message().await {
        print!("{}", message.colored_text());
        io::stdout().flush().ok();
    }

    let report = handle.wait().await.expect("Pipeline worker failed");
    match report.status {
        RunStatus::Completed => println!("\n=== Final user story ===\n{}", report.artifact),
        RunStatus::StoppedByUser => {
            println!("\n=== User story when stopped ===\n{}", report.artifact)
        }
        RunStatus::Failed(reason) => eprintln!("\nRun failed: {}", reason),
    }
    println!(
        "\nSession {} took {}s",
        report.session_id,
        (report.finished_at - report.started_at).num_seconds()
    );
}
