//! Prompt construction for the bilingual enrichment call.

/// Tag substrings the model must never emit: the dataset is remote-only, so
/// remote markers carry no signal.
pub const FORBIDDEN_TAG_SUBSTRINGS: &[&str] = &[
    "远程",
    "remote",
    "wfh",
    "work from home",
    "home office",
    "居家办公",
    "在家办公",
    "全员远程",
    "远程办公",
];

const REMOTE_CHECK_BLOCK: &str = "\
IMPORTANT CHECK FIRST:
- Check if the title OR description mentions remote work keywords: 远程 / remote / WFH / work from home / 居家办公 / 在家办公 / 全员远程 / 远程办公 / 远程岗位 / 支持远程 / 可远程 / remote work / remote position / work remotely
- If NEITHER the title NOR the description mentions remote work, this job is NOT a remote position. Return an empty JSON object: {}
- If at least one of them mentions remote work, proceed with the normal workflow below.

";

const RULES_BLOCK: &str = "\
<rules>

<title>
Step 1: Generate title_chinese (CORE VERSION)
- Extract the core role name from original_title; be short, professional, accurate.
- Remove noise words: remote/location words, hiring phrases (招聘/诚招/急招/内推/HC), location info, experience/education requirements, salary/benefits, bracket parts, company/team names.
- Keep tech terms as-is (e.g., Java, React, C++, Python).
- Output in pure Chinese.

Step 2: Generate title_english (TRANSLATION OF title_chinese)
- Translate title_chinese to clear, professional English, keeping technical terms as-is.
</title>

<tags>
Step 1: Generate tags_chinese (CORE VERSION)
- Extract 5-7 tags from the description following the order below. If an optional category is unclear, DO NOT output it; fill with other high-signal info so the total still stays 5-7.

Tag order and meaning:
1. Major Work (required): a concise phrase (MAX 8 Chinese characters) describing the core work, complementing title_chinese rather than duplicating it.
2. Industry (optional): only if it can be inferred as the MAIN industry/business from the description (e.g., \"电商行业\", \"区块链行业\").
3-4. Key Work/Requirements (required): the most distinguishing tasks, technologies, or specifics.
5. Company context (optional): 外企/美企/国内初创/国企, only when explicitly mentioned.
6. Perks excluding salary (optional): only when explicitly mentioned.
7. Other remote-seeker-important info (optional): e.g. 不加班, 弹性工作, 跨时区协作.

Length constraint: max 20 units per tag (Chinese character = 2 units, ASCII char = 1 unit).

Forbidden:
- remote/远程/WFH tags (the dataset is all remote)
- salary numbers/compensation
- company/team names
- vague filler like \"岗位职责\", \"优秀沟通\", \"有责任心\"

Step 2: Generate tags_english (TRANSLATION OF tags_chinese)
- Translate each tag one-to-one (same order, same count), keeping technical terms as-is.
</tags>

<description>
Step 1: Generate description_chinese (CORE VERSION)
- Produce a clean Chinese version of the original description, preserving structure, line breaks, bullet points and technical terms; translate English sentences to Chinese; do not omit details.

Step 2: Generate description_english (TRANSLATION OF description_chinese)
- Translate description_chinese to English, mirroring its structure and formatting exactly, keeping technical terms as-is.
</description>
";

const OUTPUT_FORMAT_KEYS: &str = "\
The output MUST be a valid JSON object with EXACT keys:
{
  \"title_chinese\": \"...\",
  \"title_english\": \"...\",
  \"tags_chinese\": [\"... (5-7 items) ...\"],
  \"tags_english\": [\"... (5-7 items) ...\"],
  \"description_chinese\": \"...\",
  \"description_english\": \"...\"
}

IMPORTANT:
- Return ONLY the JSON object itself
- Do NOT wrap it in ```json``` or ``` blocks
- Do NOT add any comments or explanations before or after the JSON
- The response must start with { and end with }
- All strings must be properly escaped if they contain quotes
</output_format>

</rules>
";

/// Corrective preamble sent once when the model violates the tag
/// constraints. The original prompt follows unchanged.
pub const CORRECTION_PREAMBLE: &str = "\
<correction>
Your previous output violated constraints.
- DO NOT include any remote/远程/WFH related tags (all jobs are remote).
- \"tags_chinese\" and \"tags_english\" MUST each contain 5-7 items.
Re-generate the JSON with the SAME required keys and rules.
CRITICAL: Return ONLY valid JSON. No markdown, no code blocks, no explanations.
</correction>
";

/// Build the bilingual enrichment prompt for one posting. When
/// `remote_check` is set the model first decides whether the posting is
/// remote at all and answers `{}` when it is not.
pub fn build_job_prompt(original_title: &str, description: &str, remote_check: bool) -> String {
    let remote_block = if remote_check { REMOTE_CHECK_BLOCK } else { "" };
    let workflow_gate = if remote_check {
        "Workflow (only if remote work is mentioned):\n"
    } else {
        "Workflow:\n"
    };
    let non_remote_line = if remote_check {
        "If the job is NOT remote (no remote work keywords found), return an empty JSON object: {}\n\n"
    } else {
        ""
    };

    format!(
        "<task>\n\
         Given <original_title> and <description>, generate the Chinese versions first, then translate them to English.\n\n\
         {remote_block}\
         {workflow_gate}\
         1. Generate title_chinese (core version) -> then translate to title_english\n\
         2. Generate tags_chinese (core version) -> then translate to tags_english (one-to-one correspondence)\n\
         3. Generate description_chinese (core version) -> then translate to description_english (preserve format structure)\n\n\
         CRITICAL REQUIREMENT: You MUST return ONLY valid JSON format. No markdown, no code blocks, no explanations, no additional text before or after the JSON.\n\
         </task>\n\n\
         <input>\n\
         <original_title>{original_title}</original_title>\n\
         <description>\n{description}\n</description>\n\
         </input>\n\n\
         {RULES_BLOCK}\n\
         <output_format>\n\
         CRITICAL: You MUST return ONLY valid JSON. No markdown, no code blocks, no explanations.\n\n\
         {non_remote_line}\
         {OUTPUT_FORMAT_KEYS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_check_toggles_the_gate_blocks() {
        let with_check = build_job_prompt("Java工程师", "职位描述", true);
        assert!(with_check.contains("IMPORTANT CHECK FIRST"));
        assert!(with_check.contains("return an empty JSON object"));

        let without_check = build_job_prompt("Backend Engineer", "description", false);
        assert!(!without_check.contains("IMPORTANT CHECK FIRST"));
        assert!(without_check.contains("Workflow:"));
    }

    #[test]
    fn prompt_embeds_the_posting_verbatim() {
        let prompt = build_job_prompt("资深后端(远程)", "负责核心服务开发", true);
        assert!(prompt.contains("<original_title>资深后端(远程)</original_title>"));
        assert!(prompt.contains("负责核心服务开发"));
    }
}
