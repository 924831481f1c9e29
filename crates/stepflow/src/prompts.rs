// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prompt templates and rendering helpers.

use crate::state::{PastStep, Step, WorkerKind};
use std::collections::VecDeque;

/// Planner prompt: decompose the objective into steps with substeps.
pub fn planner_prompt(objective: &str) -> String {
    format!(
        "You are a planner that breaks down a complex task into high-level steps and expands them into detailed hierarchical plans.\n\
         For the following task:\n{objective}\n\n\
         Create a list of 1-7 high-level sequential steps to accomplish this task.\n\
         Each step should be a clear, actionable item that leads towards the final goal.\n\
         For each high-level step, create a detailed expansion with:\n\
         1. A clear description of the step\n\
         2. 1-4 substeps that break down how to accomplish this step, depending on its complexity."
    )
}

/// Replanner prompt: restate the remaining plan or respond to the user.
pub fn replanner_prompt(objective: &str, plan: &VecDeque<Step>, past_steps: &[PastStep]) -> String {
    format!(
        "For the given objective, come up with a simple step by step plan.\n\
         This plan should involve individual tasks, that if executed correctly will yield the correct answer. Do not add any superfluous steps.\n\
         The result of the final step should be the final answer. Make sure that each step has all the information needed - do not skip steps.\n\n\
         Your objective was this:\n{objective}\n\n\
         Your original plan was this:\n{}\n\n\
         You have currently done the following steps:\n{}\n\n\
         Update your plan accordingly. If no more steps are needed and you can return to the user, then respond with that and use the 'respond' function.\n\
         Otherwise, fill out the plan with the 'plan' function.\n\
         Only add steps to the plan that still NEED to be done. Do not return previously done steps as part of the plan.",
        render_plan_outline(plan),
        render_past_steps(past_steps),
    )
}

/// Supervisor system prompt listing the available workers.
pub fn supervisor_system_prompt() -> String {
    "You are a supervisor tasked with routing tasks to specialized workers.\n\
     Available workers:\n\
     - file_worker: Handles file operations, reading, writing, and file management\n\
     - shell_worker: Executes shell commands and scripts\n\
     - browser_worker: Handles web browsing, searching, and information retrieval\n\
     - kb_worker: Retrieves information from the knowledge base using retrieval-augmented generation\n\
     - ask_user: Requests input or information from the human user\n\
     - update_user: Sends a progress notification to the human user\n\
     Given the task description and substeps, select the most appropriate worker.\n\
     If the task is complete, respond with FINISH."
        .to_string()
}

/// Supervisor routing request for one task.
pub fn supervisor_task_prompt(task: &Step) -> String {
    let worker_names: Vec<&str> = WorkerKind::ALL.iter().map(|k| k.name()).collect();
    format!(
        "Based on this information, which worker should handle this task?\n\
         Respond with one of: {} or FINISH if complete.\n\
         Provide detailed instructions for the selected worker.\n\
         Task: {}\nSubsteps: {}",
        worker_names.join(", "),
        task.description,
        task.substeps.join("\n")
    )
}

/// Relevance grading prompt: strict yes/no.
pub fn relevance_prompt(query: &str, documents: &str) -> String {
    format!(
        "You are a grader assessing the relevance of retrieved documents to a user question.\n\n\
         Respond with ONLY \"yes\" if the documents contain information relevant to answering the question.\n\
         Respond with ONLY \"no\" if the documents do not contain information relevant to the question.\n\n\
         User question: {query}\n\n\
         Retrieved documents:\n{documents}\n\n\
         Are these documents relevant to the question? Answer with ONLY \"yes\" or \"no\"."
    )
}

/// Query rewriting prompt.
pub fn rewrite_query_prompt(query: &str) -> String {
    format!(
        "You are an expert at improving search queries to get better results from a knowledge base.\n\
         Rewrite the given query to be more specific, include relevant keywords, and make it more effective for retrieval.\n\
         Return ONLY the rewritten query, nothing else.\n\n\
         Original query: {query}\n\nRewritten query:"
    )
}

/// Answer generation prompt with citation instructions.
pub fn generate_answer_prompt(query: &str, documents: &str, sources_text: &str) -> String {
    format!(
        "You are a helpful assistant that generates accurate, informative answers based on retrieved information.\n\
         When answering:\n\
         1. Stick to the information provided in the retrieved documents\n\
         2. If the documents don't contain the complete answer, acknowledge the limitations\n\
         3. Be concise but comprehensive\n\
         4. Cite sources using reference numbers [1], [2], etc. where appropriate\n\
         5. Include a \"Sources\" section at the end of your answer if you reference any sources\n\n\
         User question: {query}\n\n\
         Retrieved information:\n{documents}\n\n\
         {sources_text}\n\n\
         Please provide a helpful answer based on this information, citing sources where appropriate:"
    )
}

/// Specialist system framing for a tool-backed worker.
#[must_use]
pub fn worker_system_prompt(kind: WorkerKind) -> &'static str {
    match kind {
        WorkerKind::File => {
            "You are a file management specialist. You read, write, and organize files according to the provided instructions."
        }
        WorkerKind::Shell => {
            "You are a system operations specialist. You execute shell commands and scripts."
        }
        WorkerKind::Browser => {
            "You are a web research specialist. You browse the web, search for information, and extract data."
        }
        WorkerKind::KnowledgeBase => {
            "You are a knowledge retrieval specialist. You answer questions from the knowledge base."
        }
        WorkerKind::AskUser | WorkerKind::UpdateUser => {
            "You relay information between the system and the human user."
        }
    }
}

/// Render the remaining plan as a numbered outline with lettered substeps.
#[must_use]
pub fn render_plan_outline(plan: &VecDeque<Step>) -> String {
    plan.iter()
        .enumerate()
        .map(|(i, step)| {
            let substeps = step
                .substeps
                .iter()
                .enumerate()
                .map(|(j, substep)| {
                    let letter = char::from(b'a' + (j % 26) as u8);
                    format!("   {letter}. {substep}")
                })
                .collect::<Vec<_>>()
                .join("\n");
            if substeps.is_empty() {
                format!("{}. {}", i + 1, step.description)
            } else {
                format!("{}. {}\n{}", i + 1, step.description, substeps)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render past steps as "step: result" lines.
#[must_use]
pub fn render_past_steps(past_steps: &[PastStep]) -> String {
    past_steps
        .iter()
        .map(|p| format!("{}: {}", p.step, p.result))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render deduplicated sources as a numbered reference list.
#[must_use]
pub fn render_sources(sources: &[String]) -> String {
    if sources.is_empty() {
        return "No specific sources available.".to_string();
    }
    let lines: Vec<String> = sources
        .iter()
        .enumerate()
        .map(|(idx, src)| format!("[{}] {src}", idx + 1))
        .collect();
    format!("Sources:\n{}", lines.join("\n"))
}
