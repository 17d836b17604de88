//! Subcommand handlers.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use doclens_core::api::{ProgressFn, UploadFile, UploadProgress};
use doclens_core::models::{ChatRequest, FileEntry, NewFolder, NewKnowledgeBase, UsagePeriod};
use doclens_core::utils::{format_bytes, format_credits, format_date, truncate_string};
use doclens_core::{ApiClient, Config, Credentials, Registration, SessionStore};

/// Longest filename shown in listings before truncation.
const MAX_FILENAME_WIDTH: usize = 48;

pub struct Cli {
    config: Config,
    session: SessionStore,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        let api = ApiClient::from_config(&config).context("Failed to create API client")?;
        let tokens = config
            .token_store()
            .context("Failed to open token storage")?;
        debug!(base_url = %api.base_url(), storage = ?config.token_storage, "Client configured");

        Ok(Self {
            session: SessionStore::new(api, tokens),
            config,
        })
    }

    pub async fn run(&mut self, args: &[String]) -> Result<()> {
        let (command, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("No command given"))?;

        let status = self.session.initialize().await;
        debug!(?status, command = %command, "Session resolved");

        match command.as_str() {
            "login" => self.login(rest.first().cloned()).await,
            "register" => match rest {
                [username, email, ..] => self.register(username, email).await,
                _ => bail!("Usage: doclens register <username> <email>"),
            },
            "logout" => {
                self.session.logout();
                println!("Signed out.");
                Ok(())
            }
            "whoami" => self.whoami().await,
            "tree" => self.tree().await,
            "mkdir" => match rest {
                [name] => self.mkdir(name, None).await,
                [name, parent] => self.mkdir(name, Some(parse_id(parent, "parent folder")?)).await,
                _ => bail!("Usage: doclens mkdir <name> [parent_id]"),
            },
            "upload" => match rest {
                [path] => self.upload(path, None).await,
                [path, folder] => self.upload(path, Some(parse_id(folder, "folder")?)).await,
                _ => bail!("Usage: doclens upload <path> [folder_id]"),
            },
            "rm-file" => match rest {
                [id] => self.remove_file(parse_id(id, "file")?).await,
                _ => bail!("Usage: doclens rm-file <id>"),
            },
            "rm-folder" => match rest {
                [id] => self.remove_folder(parse_id(id, "folder")?).await,
                _ => bail!("Usage: doclens rm-folder <id>"),
            },
            "usage" => {
                let period = match rest.first() {
                    Some(p) => p.parse::<UsagePeriod>().map_err(|e| anyhow!(e))?,
                    None => UsagePeriod::default(),
                };
                self.usage(period).await
            }
            "kb" => self.knowledge_base(rest).await,
            "chat" => self.chat(rest).await,
            "forgot-password" => match rest {
                [email] => self.forgot_password(email).await,
                _ => bail!("Usage: doclens forgot-password <email>"),
            },
            "reset-password" => match rest {
                [token] => self.reset_password(token).await,
                _ => bail!("Usage: doclens reset-password <token>"),
            },
            other => bail!("Unknown command '{}'. Run 'doclens --help' for usage.", other),
        }
    }

    fn require_login(&self) -> Result<()> {
        if self.session.is_authenticated() {
            Ok(())
        } else {
            bail!("Not signed in. Run 'doclens login' first.")
        }
    }

    // ===== Account =====

    async fn login(&mut self, username: Option<String>) -> Result<()> {
        let username = match username.or_else(|| self.config.last_username.clone()) {
            Some(username) => {
                println!("Signing in as {}", username);
                username
            }
            None => prompt("Username: ")?,
        };
        let password = rpassword::prompt_password("Password: ")?;

        let credentials = Credentials::new(username.clone(), password);
        if !credentials.is_complete() {
            bail!("Username and password required");
        }

        let user = self.session.login(credentials).await?;

        self.config.last_username = Some(username);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        println!(
            "Signed in as {} ({} credits)",
            user.username,
            user.credits_display()
        );
        Ok(())
    }

    async fn register(&self, username: &str, email: &str) -> Result<()> {
        let password = prompt_new_password()?;
        let created = self
            .session
            .register(Registration::new(username, email, password))
            .await?;

        println!(
            "Account '{}' created. Check {} for a verification link, then run 'doclens login'.",
            created.username, created.email
        );
        Ok(())
    }

    async fn whoami(&self) -> Result<()> {
        self.require_login()?;
        let user = self.session.refresh_user().await?;
        println!("{} <{}>", user.username, user.email);
        println!("Credits: {}", user.credits_display());
        Ok(())
    }

    async fn forgot_password(&self, email: &str) -> Result<()> {
        self.session.request_password_reset(email).await?;
        println!("If an account exists for {}, a reset link is on its way.", email);
        Ok(())
    }

    async fn reset_password(&self, token: &str) -> Result<()> {
        let password = prompt_new_password()?;
        self.session.reset_password(token, &password).await?;
        println!("Password updated. Run 'doclens login' to sign in.");
        Ok(())
    }

    // ===== Folders and files =====

    async fn tree(&self) -> Result<()> {
        self.require_login()?;
        let tree = self.session.api().folder_tree().await?;
        if tree.is_empty() {
            println!("No folders or files yet.");
            return Ok(());
        }

        for (depth, folder) in tree.walk() {
            let indent = "  ".repeat(depth);
            println!("{}{}/ [{}]", indent, folder.name, folder.id);
            for file in &folder.files {
                print_file(&format!("{}  ", indent), file);
            }
        }
        for file in &tree.files {
            print_file("", file);
        }
        println!(
            "\n{} folders, {} files",
            tree.folder_count(),
            tree.file_count()
        );
        Ok(())
    }

    async fn mkdir(&self, name: &str, parent_id: Option<i64>) -> Result<()> {
        self.require_login()?;
        let folder = self
            .session
            .api()
            .create_folder(&NewFolder {
                name: name.to_string(),
                parent_id,
            })
            .await?;
        println!("Created folder '{}' [{}]", folder.name, folder.id);
        Ok(())
    }

    async fn upload(&self, path: &str, folder_id: Option<i64>) -> Result<()> {
        self.require_login()?;
        let file = UploadFile::from_path(Path::new(path))
            .await
            .with_context(|| format!("Failed to read {}", path))?;

        let name = file.filename().to_string();
        let label = name.clone();
        let progress: ProgressFn = Arc::new(move |p: UploadProgress| {
            match p.percent() {
                Some(percent) => eprint!("\rUploading {}: {:>3}%", label, percent),
                None => eprint!("\rUploading {}: {}", label, format_bytes(p.sent)),
            }
            let _ = io::stderr().flush();
        });

        let result = self
            .session
            .api()
            .upload_file(folder_id, file, Some(progress))
            .await;
        eprintln!();

        let entry = result.with_context(|| format!("Upload of {} failed", name))?;
        println!(
            "Uploaded {} [{}] {}",
            entry.filename,
            entry.id,
            entry.size_display()
        );
        Ok(())
    }

    async fn remove_file(&self, id: i64) -> Result<()> {
        self.require_login()?;
        self.session.api().delete_file(id).await?;
        println!("Deleted file {}", id);
        Ok(())
    }

    async fn remove_folder(&self, id: i64) -> Result<()> {
        self.require_login()?;
        self.session.api().delete_folder(id).await?;
        println!("Deleted folder {}", id);
        Ok(())
    }

    // ===== Usage =====

    async fn usage(&self, period: UsagePeriod) -> Result<()> {
        self.require_login()?;
        let usage = self.session.usage(period).await?;

        println!("Usage ({})", period);
        if usage.has_activity() {
            println!("  Calls:          {}", usage.total_calls);
            println!("  Credits used:   {}", format_credits(usage.total_credits_used));
            if let Some(ref endpoint) = usage.most_used_endpoint {
                println!("  Most used:      {}", endpoint);
            }
        } else {
            println!("  No API calls in this period.");
        }
        println!("  Credits left:   {}", format_credits(usage.remaining_credits));
        Ok(())
    }

    // ===== Knowledge bases and chat =====

    async fn knowledge_base(&self, args: &[String]) -> Result<()> {
        self.require_login()?;
        let api = self.session.api();

        match args {
            [sub] if sub == "list" => {
                let kbs = api.knowledge_bases().await?;
                if kbs.is_empty() {
                    println!("No knowledge bases yet.");
                }
                for kb in kbs {
                    let created = kb.created_at.as_deref().map(format_date).unwrap_or_default();
                    println!(
                        "[{}] {} ({} files) {}",
                        kb.id,
                        kb.name,
                        kb.file_ids.len(),
                        created
                    );
                    if let Some(description) = kb.description.filter(|d| !d.is_empty()) {
                        println!("    {}", truncate_string(&description, 72));
                    }
                }
                Ok(())
            }
            [sub, name, file_ids @ ..] if sub == "create" && !file_ids.is_empty() => {
                let ids = file_ids
                    .iter()
                    .map(|id| parse_id(id, "file"))
                    .collect::<Result<Vec<_>>>()?;
                let kb = api.create_knowledge_base(&NewKnowledgeBase::new(name.as_str(), ids)).await?;
                println!(
                    "Created knowledge base '{}' [{}] with {} files",
                    kb.name,
                    kb.id,
                    kb.file_ids.len()
                );
                Ok(())
            }
            [sub, id] if sub == "delete" => {
                let id = parse_id(id, "knowledge base")?;
                api.delete_knowledge_base(id).await?;
                println!("Deleted knowledge base {}", id);
                Ok(())
            }
            _ => bail!("Usage: doclens kb list | kb create <name> <file_id..> | kb delete <id>"),
        }
    }

    async fn chat(&self, args: &[String]) -> Result<()> {
        self.require_login()?;

        let mut words = Vec::new();
        let mut knowledge_base = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "--kb" {
                let id = iter
                    .next()
                    .ok_or_else(|| anyhow!("--kb needs a knowledge base id"))?;
                knowledge_base = Some(parse_id(id, "knowledge base")?);
            } else {
                words.push(arg.as_str());
            }
        }
        if words.is_empty() {
            bail!("Usage: doclens chat <message> [--kb id]");
        }

        let mut request = ChatRequest::new(words.join(" "));
        if let Some(id) = knowledge_base {
            request = request.with_knowledge_base(id);
        }

        let epoch = self.session.epoch();
        let reply = self.session.api().chat(&request).await?;
        if !self.session.is_current(epoch) {
            bail!("Session ended while waiting for the reply");
        }

        println!("{}", reply.response);
        if let Some(credits) = reply.credits_used {
            debug!(credits, "Chat reply billed");
        }
        Ok(())
    }
}

fn print_file(indent: &str, file: &FileEntry) {
    println!(
        "{}{} [{}] {} {}",
        indent,
        truncate_string(&file.filename, MAX_FILENAME_WIDTH),
        file.id,
        file.size_display(),
        file.uploaded_display()
    );
}

fn parse_id(value: &str, what: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} id '{}'", what, value))
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_new_password() -> Result<String> {
    let password = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    if password != confirm {
        bail!("Passwords do not match");
    }
    Ok(password)
}
