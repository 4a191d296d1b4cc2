use crate::clients::{setup_gateway_client, setup_store};
use crate::config::Config;
use crate::dispatch::DispatchEngine;
use crate::error::Error;
use crate::gateway::{Gateway, GatewayClient};
use crate::models::{Message, MessageStatus};
use crate::sweeper::{health_server, run_sweeper, shutdown_signal};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TEST_DESTINATION: &str = "123123123";

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>;
type Handler = for<'a> fn(&'a Context, &'a Invocation) -> CommandFuture<'a>;

/// Everything a command handler may touch, built once at startup.
pub struct Context {
    pub config: Config,
    pub engine: Arc<DispatchEngine<GatewayClient>>,
}

impl Context {
    pub async fn connect(config: Config) -> Result<Self, Error> {
        info!("Connecting to database...");
        let store = setup_store(&config).await?;
        info!("Database connection established.");

        let gateway = setup_gateway_client(&config)?;
        let engine = DispatchEngine::new(store, gateway, config.claim_lease());

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }
}

/// Positional arguments after the command name, plus `--count`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub count: i64,
}

pub struct Command {
    pub usage: &'static str,
    pub summary: &'static str,
    handler: Handler,
}

impl Command {
    pub async fn run(&self, ctx: &Context, invocation: &Invocation) -> Result<(), Error> {
        (self.handler)(ctx, invocation).await
    }
}

pub struct Registry {
    commands: BTreeMap<&'static str, Command>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: BTreeMap::new(),
        };
        registry.register(
            "show_credit",
            "show_credit",
            "obtains and prints remaining credit",
            show_credit,
        );
        registry.register("list_queued", "list_queued", "lists queued messages", list_queued);
        registry.register("list_all", "list_all", "lists all messages", list_all);
        registry.register("process", "process", "processes queued messages", process);
        registry.register(
            "send",
            "send <target> <message>",
            "queues a message to target (message must be double quoted)",
            send,
        );
        registry.register("test_add", "test_add", "queues --count sample messages", test_add);
        registry.register(
            "test",
            "test",
            "recreates the db, queues two samples and processes them *** WARNING",
            smoke_test,
        );
        registry.register(
            "reset_database",
            "reset_database",
            "recreates the db *** WARNING cannot be undone",
            reset_database,
        );
        registry.register("run", "run", "sweeps the queue periodically until stopped", run);
        registry
    }

    fn register(
        &mut self,
        name: &'static str,
        usage: &'static str,
        summary: &'static str,
        handler: Handler,
    ) {
        self.commands.insert(name, Command { usage, summary, handler });
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn help(&self) -> String {
        let width = self.commands.values().map(|c| c.usage.len()).max().unwrap_or(0);
        let mut help = String::from("Commands:\n");
        for command in self.commands.values() {
            help.push_str(&format!("  {:width$}  {}\n", command.usage, command.summary));
        }
        help
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn print_rows(messages: &[Message]) {
    for message in messages {
        println!("* row {}", message);
    }
}

fn show_credit<'a>(ctx: &'a Context, _invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        println!("getting credit..");
        let response = ctx.engine.gateway().get_credit().await?;
        println!("{}", response.credit()?);
        Ok(())
    })
}

fn list_queued<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        println!("** Listing pending messages..");
        let messages = ctx
            .engine
            .store()
            .fetch_by_status(MessageStatus::Queued, invocation.count)
            .await?;
        print_rows(&messages);
        Ok(())
    })
}

fn list_all<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        println!("** Listing all messages..");
        let messages = ctx.engine.store().fetch_all(invocation.count).await?;
        print_rows(&messages);
        Ok(())
    })
}

fn process<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        let processed = ctx.engine.process(invocation.count).await?;
        println!("* processed {} messages", processed);
        Ok(())
    })
}

fn send<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        let [target, message] = invocation.args.as_slice() else {
            return Err(Error::InvalidMessage(
                "missing <target> <message> arguments".to_string(),
            ));
        };
        let id = ctx.engine.queue(target, message).await?;
        let queued = ctx.engine.store().get(id).await?;
        println!("* queued {}", queued);
        Ok(())
    })
}

fn test_add<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        if invocation.count <= 0 {
            return Err(Error::InvalidLimit(invocation.count));
        }
        for counter in 0..invocation.count {
            ctx.engine
                .queue(TEST_DESTINATION, &format!("Hello World{}", counter))
                .await?;
        }
        println!("* queued {} test messages", invocation.count);
        Ok(())
    })
}

/// Starts from an empty table, queues two samples, sends them and lists the result.
fn smoke_test<'a>(ctx: &'a Context, invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        let store = ctx.engine.store();
        store.reset().await?;
        for _ in 0..2 {
            ctx.engine.queue(TEST_DESTINATION, "Hello World").await?;
        }

        println!("*** queued rows");
        print_rows(&store.fetch_by_status(MessageStatus::Queued, invocation.count).await?);

        let processed = ctx.engine.process(invocation.count).await?;
        println!("* processed {} messages", processed);

        println!("*** queued");
        print_rows(&store.fetch_by_status(MessageStatus::Queued, invocation.count).await?);

        println!("*** all rows");
        print_rows(&store.fetch_all(invocation.count).await?);
        Ok(())
    })
}

fn reset_database<'a>(ctx: &'a Context, _invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        ctx.engine.store().reset().await?;
        println!("** database reset");
        Ok(())
    })
}

fn run<'a>(ctx: &'a Context, _invocation: &'a Invocation) -> CommandFuture<'a> {
    Box::pin(async move {
        let cancel = CancellationToken::new();
        let server = health_server(ctx.config.health_port)?;
        let server_handle = server.handle();

        let sweep = async {
            tokio::join!(
                run_sweeper(
                    Arc::clone(&ctx.engine),
                    Duration::from_millis(ctx.config.sweep_interval_ms),
                    ctx.config.batch_size,
                    cancel.clone(),
                ),
                async {
                    shutdown_signal().await;
                    cancel.cancel();
                },
            );
            server_handle.stop(true).await;
        };

        let (served, ()) = tokio::join!(server, sweep);
        served?;
        Ok(())
    })
}
