use serde::{Deserialize, Serialize};

/// How a command should be supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// Bounded by the generic execution timeout.
    Foreground,
    /// Dependency installs get a longer timeout.
    Install,
    /// Never exits on its own; runs as a persistent streamed exec.
    DevServer,
}

const DEV_SERVER_PATTERNS: &[&str] = &[
    "npm run dev",
    "npm start",
    "npm run start",
    "yarn dev",
    "yarn start",
    "pnpm dev",
    "pnpm start",
    "next dev",
    "vite",
    "nodemon",
    "webpack serve",
    "astro dev",
];

const INSTALL_PATTERNS: &[&str] = &[
    "npm install",
    "npm ci",
    "npm i ",
    "yarn install",
    "yarn add",
    "pnpm install",
    "pnpm add",
    "bun install",
];

/// Classify a command string so the runner can pick timeout and supervision
/// strategy. Matching is substring-based, same as the commands users type.
pub fn classify(command: &str) -> CommandKind {
    let trimmed = command.trim();
    if DEV_SERVER_PATTERNS.iter().any(|p| trimmed.contains(p)) {
        return CommandKind::DevServer;
    }
    let padded = format!("{trimmed} ");
    if INSTALL_PATTERNS.iter().any(|p| padded.contains(p)) {
        return CommandKind::Install;
    }
    CommandKind::Foreground
}

/// A quick command offered to the UI for one-click execution.
#[derive(Debug, Clone, Serialize)]
pub struct CommonCommand {
    pub name: &'static str,
    pub command: &'static str,
    pub description: &'static str,
}

pub fn common_commands() -> Vec<CommonCommand> {
    vec![
        CommonCommand {
            name: "Install dependencies",
            command: "npm install",
            description: "Install project dependencies from package.json",
        },
        CommonCommand {
            name: "Start dev server",
            command: "npm run dev",
            description: "Start the development server with hot reload",
        },
        CommonCommand {
            name: "Build",
            command: "npm run build",
            description: "Create a production build",
        },
        CommonCommand {
            name: "Run tests",
            command: "npm test",
            description: "Run the project test suite",
        },
        CommonCommand {
            name: "List files",
            command: "ls -la",
            description: "List files in the project directory",
        },
        CommonCommand {
            name: "Node version",
            command: "node --version",
            description: "Show the Node.js version inside the sandbox",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_server_commands_are_detected() {
        assert_eq!(classify("npm run dev"), CommandKind::DevServer);
        assert_eq!(classify("  yarn dev"), CommandKind::DevServer);
        assert_eq!(classify("npx vite --port 3000"), CommandKind::DevServer);
    }

    #[test]
    fn install_commands_are_detected() {
        assert_eq!(classify("npm install"), CommandKind::Install);
        assert_eq!(classify("npm i react"), CommandKind::Install);
        assert_eq!(classify("pnpm add -D typescript"), CommandKind::Install);
    }

    #[test]
    fn everything_else_is_foreground() {
        assert_eq!(classify("echo hi"), CommandKind::Foreground);
        assert_eq!(classify("npm run build"), CommandKind::Foreground);
        // "install" alone is not a package-manager invocation
        assert_eq!(classify("cat install.md"), CommandKind::Foreground);
    }
}
