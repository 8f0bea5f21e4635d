use clap::{Parser, Subcommand};
use eyre::Result;
use packed_odb::subcommand;

#[derive(Parser, Debug)]
#[command(version)]
struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    CatFile {
        #[arg(short)]
        pretty: bool,

        #[arg(short = 't', long = "type", value_name = "TYPE")]
        expect_type: Option<String>,

        #[arg(value_name = "object")]
        object_hash: String,
    },
    HashObject {
        #[arg(short)]
        write: bool,

        path: String,
    },
    VerifyPack {
        #[arg(value_name = "index_file")]
        index_file: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let app = App::parse();
    match app.command {
        Command::Init => subcommand::init::run(),
        Command::CatFile { pretty, expect_type, object_hash } => {
            subcommand::cat_file::run(pretty, expect_type.as_deref(), &object_hash)
        }
        Command::HashObject { write, path } => subcommand::hash_object::run(write, &path),
        Command::VerifyPack { index_file } => subcommand::verify_pack::run(&index_file),
    }
}
