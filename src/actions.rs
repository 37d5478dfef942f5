//! Command line actions.

use std::error::Error;
use std::io::{BufRead, Write};
use std::sync::mpsc;

use log::{debug, info};

use crate::config::Config;
use crate::inventory::{diff, is_listable, is_named_uninstallable, uninstall_roots, Inventory};
use crate::keys::{KeyPath, RegistryRead, RegistryWrite};
use crate::launch::Launcher;
use crate::program::{ProgramError, ProgramRecord};
use crate::watch::{ChangeKind, KeyChange, KeyWatcher, RegistryWatch, WatchError};

pub type ActionResult = Result<(), Box<dyn Error>>;

/// How many parameters an action takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Help,
    List,
    Search,
    Info,
    Remove,
    RegRemove,
    Watch,
    Export,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Help,
        Action::List,
        Action::Search,
        Action::Info,
        Action::Remove,
        Action::RegRemove,
        Action::Watch,
        Action::Export,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Action::Help => "help",
            Action::List => "list",
            Action::Search => "search",
            Action::Info => "info",
            Action::Remove => "remove",
            Action::RegRemove => "regremove",
            Action::Watch => "watch",
            Action::Export => "export",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Action::Help | Action::List | Action::Watch | Action::Export => Arity::Exactly(0),
            Action::Search | Action::Info | Action::Remove | Action::RegRemove => Arity::Exactly(1),
        }
    }

    pub fn from_name(name: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// Everything an action may touch.
pub struct Session<'a, R, L> {
    pub registry: &'a R,
    pub launcher: &'a L,
    pub config: &'a Config,
    pub input: &'a mut dyn BufRead,
    pub output: &'a mut dyn Write,
}

impl<'a, R, L> Session<'a, R, L>
where
    R: RegistryRead + RegistryWrite + RegistryWatch,
    L: Launcher,
{
    pub fn new(
        registry: &'a R,
        launcher: &'a L,
        config: &'a Config,
        input: &'a mut dyn BufRead,
        output: &'a mut dyn Write,
    ) -> Self {
        Session {
            registry,
            launcher,
            config,
            input,
            output,
        }
    }

    fn filter(&self) -> fn(&ProgramRecord) -> bool {
        if self.config.include_components {
            is_named_uninstallable
        } else {
            is_listable
        }
    }

    fn list(&self) -> Vec<ProgramRecord> {
        Inventory::new(self.registry).list_all_with(self.filter())
    }

    fn search(&self, query: &str) -> Result<Vec<ProgramRecord>, regex::Error> {
        Inventory::new(self.registry).search_with(query, self.filter())
    }

    fn read_line(&mut self) -> std::io::Result<String> {
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }

    /// Single matches are returned as is; otherwise the user picks one by number.
    fn select(&mut self, mut records: Vec<ProgramRecord>) -> std::io::Result<Option<ProgramRecord>> {
        if records.len() == 1 {
            return Ok(records.pop());
        }

        for (i, record) in records.iter().enumerate() {
            writeln!(self.output, "[{}] {}", i, record)?;
        }
        write!(self.output, "Choice (Return to cancel): ")?;
        let choice = self.read_line()?;

        Ok(choice
            .parse::<usize>()
            .ok()
            .filter(|&i| i < records.len())
            .map(|i| records.swap_remove(i)))
    }

    /// Runs `name` with `params`. Unknown names show help.
    pub fn dispatch(&mut self, name: &str, params: &[String]) -> ActionResult {
        let (action, params) = match Action::from_name(name) {
            Some(action) => (action, params),
            None => {
                debug!("Unknown action '{}'", name);
                (Action::Help, &[][..])
            }
        };

        if let Arity::Exactly(count) = action.arity() {
            if params.len() != count {
                let plural = if count != 1 { "s" } else { "" };
                writeln!(self.output, "This action require {} parameter{}.", count, plural)?;
                return Ok(());
            }
        }

        info!("Running {}", action.name());
        match action {
            Action::Help => self.help(),
            Action::List => self.list_programs(),
            Action::Search => self.search_programs(&params[0]),
            Action::Info => self.show_info(&params[0]),
            Action::Remove => self.remove(&params[0]),
            Action::RegRemove => self.reg_remove(&params[0]),
            Action::Watch => self.watch(),
            Action::Export => self.export(),
        }
    }

    fn help(&mut self) -> ActionResult {
        let names: Vec<&str> = Action::ALL.iter().map(Action::name).collect();

        writeln!(self.output, "{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
        writeln!(self.output)?;
        writeln!(self.output, "Usage: {} action [parameter]", env!("CARGO_PKG_NAME"))?;
        writeln!(self.output)?;
        writeln!(self.output, "Actions: {}.", names.join(", "))?;
        Ok(())
    }

    fn list_programs(&mut self) -> ActionResult {
        for record in self.list() {
            writeln!(self.output, "{}", record)?;
        }
        Ok(())
    }

    /// The listing as a JSON array, for scripts.
    fn export(&mut self) -> ActionResult {
        let records = self.list();
        serde_json::to_writer_pretty(&mut *self.output, &records)?;
        writeln!(self.output)?;
        Ok(())
    }

    fn search_programs(&mut self, query: &str) -> ActionResult {
        if query.trim().is_empty() {
            writeln!(
                self.output,
                "Unable to search nothing, if you want to list all programs use the \"list\" action."
            )?;
            return Ok(());
        }

        let found = self.search(query)?;
        if found.is_empty() {
            writeln!(self.output, "No results")?;
        }
        for record in found {
            writeln!(self.output, "{}", record)?;
        }
        Ok(())
    }

    fn find_one(&mut self, query: &str) -> Result<Option<ProgramRecord>, Box<dyn Error>> {
        let found = self.search(query)?;
        if found.is_empty() {
            writeln!(self.output, "Not found")?;
            return Ok(None);
        }
        Ok(self.select(found)?)
    }

    fn show_info(&mut self, query: &str) -> ActionResult {
        let Some(record) = self.find_one(query)? else {
            return Ok(());
        };

        let field = |value: Option<&str>| value.unwrap_or("-").to_string();
        writeln!(self.output, "Name:        {}", record)?;
        writeln!(self.output, "Publisher:   {}", field(record.publisher()))?;
        writeln!(self.output, "Comments:    {}", field(record.comments()))?;
        writeln!(self.output, "Uninstall:   {}", field(record.uninstall_command()))?;
        writeln!(self.output, "Directory:   {}", field(record.uninstall_working_dir()))?;
        match record.icon_location() {
            Some(icon) => writeln!(self.output, "Icon:        {} ({})", icon.path, icon.index)?,
            None => writeln!(self.output, "Icon:        -")?,
        }
        if let Some(code) = record.product_code() {
            writeln!(self.output, "Product:     {{{}}}", code.hyphenated().to_string().to_uppercase())?;
        }
        writeln!(self.output, "Key:         {}", record.registry_path())?;
        Ok(())
    }

    fn remove(&mut self, query: &str) -> ActionResult {
        let Some(record) = self.find_one(query)? else {
            return Ok(());
        };

        writeln!(self.output, "Running \"{}\" uninstaller...", record)?;
        match record.uninstall(self.launcher) {
            Err(e @ ProgramError::NotUninstallable { .. }) => {
                writeln!(self.output, "{}", e)?;
                Ok(())
            }
            result => Ok(result?),
        }
    }

    fn reg_remove(&mut self, query: &str) -> ActionResult {
        let found = self.search(query)?;
        if found.is_empty() {
            writeln!(self.output, "Not found")?;
            return Ok(());
        }

        // Picking from several matches counts as confirmation.
        let confirmed = found.len() > 1;
        let Some(record) = self.select(found)? else {
            return Ok(());
        };

        if !confirmed {
            writeln!(
                self.output,
                "Are you sure to remove the installer of \"{0}\"\r\nfrom the uninstall list, without removing \"{0}\" ? (y/n)",
                record
            )?;
            let answer = self.read_line()?;
            if !answer.starts_with('y') {
                return Ok(());
            }
        }

        record.remove_from_registry(self.registry)?;
        writeln!(self.output, "\"{}\" removed from uninstall list.", record)?;
        Ok(())
    }

    /// Prints what appears and disappears until every watched key is gone.
    fn watch(&mut self) -> ActionResult {
        enum Event {
            Change(KeyChange),
            Fault(KeyPath, WatchError),
        }

        let (tx, rx) = mpsc::channel();
        let filter = self.config.watch.notify_filter();
        let scope = self.config.watch.watch_scope();

        let mut watchers = Vec::new();
        for root in uninstall_roots() {
            let changes = tx.clone();
            let faults = tx.clone();
            let key = root.clone();
            let started = KeyWatcher::start(
                self.registry,
                root.clone(),
                filter,
                scope,
                move |change| {
                    let _ = changes.send(Event::Change(change));
                },
                move |e| {
                    let _ = faults.send(Event::Fault(key, e));
                },
            );
            match started {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => debug!("Not watching {}: {}", root, e),
            }
        }
        // Only the watcher threads hold senders now, so the loop below ends
        // once all of them have exited.
        drop(tx);

        if watchers.is_empty() {
            writeln!(self.output, "Nothing to watch")?;
            return Ok(());
        }
        writeln!(self.output, "Watching {} uninstall keys...", watchers.len())?;
        self.output.flush()?;

        let mut current = self.list();
        for event in rx {
            match event {
                Event::Change(change) => {
                    if change.kind == ChangeKind::Deleted {
                        writeln!(self.output, "{} deleted", change.key)?;
                    }
                    let latest = self.list();
                    let changes = diff(&current, &latest);
                    for record in &changes.added {
                        writeln!(self.output, "+ {}", record)?;
                    }
                    for record in &changes.removed {
                        writeln!(self.output, "- {}", record)?;
                    }
                    current = latest;
                }
                Event::Fault(key, e) => writeln!(self.output, "Watching {} failed: {}", key, e)?,
            }
            self.output.flush()?;
        }

        for mut watcher in watchers {
            watcher.dispose()?;
        }
        Ok(())
    }
}
