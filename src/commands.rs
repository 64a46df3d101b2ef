/// Commands of the `watch` console and their lookup

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All console commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "tickets",
    aliases: &["t", "mine"],
    description: "Your tickets",
  },
  Command {
    name: "all",
    aliases: &["a", "queue"],
    description: "Every ticket (support and admin)",
  },
  Command {
    name: "assigned",
    aliases: &["as"],
    description: "Tickets assigned to you (support)",
  },
  Command {
    name: "notifications",
    aliases: &["n", "notifs", "inbox"],
    description: "Latest notifications",
  },
  Command {
    name: "read-all",
    aliases: &["ra", "clear"],
    description: "Mark every notification as read",
  },
  Command {
    name: "dashboard",
    aliases: &["d", "dash", "stats"],
    description: "Dashboard counters",
  },
  Command {
    name: "users",
    aliases: &["u", "people"],
    description: "User accounts (admin)",
  },
  Command {
    name: "refresh",
    aliases: &["r", "reload"],
    description: "Refetch everything on screen",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Leave the console",
  },
];

/// How well `input` names `cmd`; lower is better, `None` is no match.
fn rank(cmd: &Command, input: &str) -> Option<u32> {
  if cmd.name == input {
    Some(0)
  } else if cmd.aliases.contains(&input) {
    Some(1)
  } else if cmd.name.starts_with(input) {
    Some(2)
  } else if cmd.aliases.iter().any(|a| a.starts_with(input)) {
    Some(3)
  } else if cmd.name.contains(input) {
    Some(4)
  } else if cmd.aliases.iter().any(|a| a.contains(input)) {
    Some(5)
  } else {
    None
  }
}

/// Get suggestions for a given input, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input = input.trim().to_lowercase();

  if input.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&'static Command, u32)> = COMMANDS
    .iter()
    .filter_map(|cmd| rank(cmd, &input).map(|r| (cmd, r)))
    .collect();

  // Stable, so table order breaks ties
  matches.sort_by_key(|(_, r)| *r);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// The command `input` resolves to. Empty input resolves to nothing.
pub fn resolve(input: &str) -> Option<&'static Command> {
  if input.trim().is_empty() {
    return None;
  }
  get_suggestions(input).into_iter().next()
}
