mod args;
mod logging;
mod lookup;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let command = crate::args::root_command();
    let arg_matches = command.get_matches();

    crate::logging::set_up_logging(&arg_matches)?;

    let result = match arg_matches.subcommand() {
        Some(("lookup", sub_matches)) => crate::lookup::run(sub_matches).await,
        _ => unreachable!(),
    };

    match result {
        Ok(_) => {
            tracing::info!("program exit ok");
            Ok(())
        }
        Err(error) => {
            tracing::error!(%error, "program exit error");
            Err(error)
        }
    }
}
