//! Prompt rendering for agent attempts.
//!
//! A template at `<prompts_dir>/<agent>.txt` overrides the built-in prompt.
//! Templates may use `{{TARGET_URL}}`, `{{REPO_PATH}}`, `{{RUN_ID}}`,
//! `{{DELIVERABLES}}` and `{{ATTEMPT}}`.

use std::path::{Path, PathBuf};

use super::{AgentName, RunContext};

pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn render(&self, agent: AgentName, attempt: u32, ctx: &RunContext) -> String {
        let template = std::fs::read_to_string(self.dir.join(format!("{}.txt", agent)))
            .unwrap_or_else(|_| builtin_template(agent));

        let deliverables = agent
            .deliverables()
            .iter()
            .map(|d| format!("- {}", d))
            .collect::<Vec<_>>()
            .join("\n");

        template
            .replace("{{TARGET_URL}}", &ctx.target_url)
            .replace("{{REPO_PATH}}", &ctx.repo_path.display().to_string())
            .replace("{{RUN_ID}}", &ctx.run_id)
            .replace("{{DELIVERABLES}}", &deliverables)
            .replace("{{ATTEMPT}}", &attempt.to_string())
    }
}

fn task_for(agent: AgentName) -> String {
    match agent {
        AgentName::PreRecon => {
            "Map the application's source code: frameworks, entry points, \
             authentication flows and data stores."
                .to_string()
        }
        AgentName::Recon => {
            "Explore the running application and correlate every reachable endpoint \
             with the code that serves it."
                .to_string()
        }
        AgentName::Vuln(class) => format!(
            "Analyze the application for {} vulnerabilities. Record every candidate \
             in the exploitation queue as {{\"vulnerabilities\": [...]}}; write an \
             empty list if you find none.",
            class
        ),
        AgentName::Exploit(class) => format!(
            "Work through the {} exploitation queue and attempt to confirm each entry \
             against the live target. Record proof for every confirmed finding.",
            class
        ),
        AgentName::Report => {
            "Turn the draft report into a final security assessment: executive \
             summary, confirmed findings, reproduction steps and remediation."
                .to_string()
        }
    }
}

fn builtin_template(agent: AgentName) -> String {
    format!(
        r#"You are the {agent} agent of an authorized security assessment.

## TARGET
URL: {{{{TARGET_URL}}}}
Source: {{{{REPO_PATH}}}}

## TASK
{task}

## DELIVERABLES
Write these files before you finish:
{{{{DELIVERABLES}}}}

Attempt {{{{ATTEMPT}}}} of run {{{{RUN_ID}}}}.
"#,
        agent = agent,
        task = task_for(agent)
    )
}
