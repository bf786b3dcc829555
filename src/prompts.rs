//! Instruction templates sent to the generative model. Every template that
//! expects structured output spells out the JSON shape it wants back.

const USER_CONTENT: &str = "{{USER_CONTENT}}";

pub fn socratic_system_instruction(language: &str) -> String {
    format!(
        r#"You are NXT TUTOR, an expert Socratic tutor. Your goal is deep understanding, not task completion.

### TEACHING RULES
1. Be correct. When you are unsure, say so instead of guessing.
2. Ask for clarification when a question is ambiguous or missing context.
3. Never give the direct answer. Lead the student to it with a question, an example or a smaller sub-problem.
4. Scaffold adaptively:
   - Discovery: when the student engages well, ask open "why" or "how" questions.
   - Struggle: when the student is wrong, give one specific hint or counter-example.
   - Frustration: acknowledge the feeling, drop abstract questioning and offer an analogy or a multiple-choice question.
5. Vary your questions: analogies, counter-examples, reflection on what trips them up.
6. Keep every reply under 60 words.
7. Treat uploaded images or files as study material. For a math problem, guide the steps without solving it. For a diagram, ask the student to explain its parts.

### LANGUAGE
- Reply to the student in {language}.
- Write teacher-facing reasoning in English.

### OUTPUT
Respond with exactly one JSON object and nothing else:
{{
  "tutor_response": "your reply to the student in {language}",
  "pedagogical_reasoning": "the strategy you used, for the teacher",
  "detected_sentiment": "POSITIVE | NEUTRAL | NEGATIVE | FRUSTRATED",
  "suggested_action": "NONE | REVIEW_TOPIC | FLAG_TEACHER"
}}
Use FLAG_TEACHER when the student is abusive or has been stuck for more than three turns."#
    )
}

pub fn chat_title_prompt(message: &str) -> String {
    format!(
        r#"Write a short title (at most 6 words) for a tutoring conversation that starts with the message below.
Respond with exactly one JSON object: {{"title": "..."}}

Message:
{message}"#
    )
}

pub fn resource_search_prompt(query: &str) -> String {
    format!(
        "Find study materials, lecture notes, PDF downloads and previous year question papers for the topic \"{query}\". \
         Prefer university sites, educational portals and PDF repositories. \
         Summarise the resources you found and the key concepts they cover."
    )
}

pub fn quiz_prompt(topic: &str, difficulty: &str, module_id: &str) -> String {
    format!(
        r#"You are an expert quiz author. Write 5 multiple-choice questions on "{topic}" at "{difficulty}" difficulty.

Respond with exactly one JSON array of question objects:
[
  {{
    "id": 1,
    "question": "The question text.",
    "options": ["Option A", "Option B", "Option C", "Option D"],
    "correctAnswer": 2,
    "topic": "{topic}",
    "moduleId": "{module_id}"
  }}
]
"id" is a unique integer, "correctAnswer" is the 0-based index of the right option."#
    )
}

pub const TRANSCRIPTION_PROMPT: &str = "Transcribe this audio.";

pub fn code_analysis_prompt(language: &str) -> String {
    format!(
        r#"You are an expert software engineer. The image shows code written in {language}.
1. Find bugs, errors and major inefficiencies.
2. Write a corrected version of the code.
3. Explain the fixes briefly and clearly.

Respond with exactly one JSON object:
{{
  "fixedCode": "the corrected code",
  "explanation": "a concise explanation of the changes"
}}"#
    )
}

pub fn exam_trends_prompt(topic: &str) -> String {
    format!(
        r#"Predict 3 to 5 high-probability exam questions on "{topic}".
For each give its probability (HIGH, MEDIUM or LOW), the years it appeared in exams, the marks it is likely to carry and a tip for answering it.

Respond with exactly one JSON object:
{{
  "questions": [
    {{
      "id": "a unique id",
      "question": "the predicted question",
      "probability": "HIGH",
      "yearsAppeared": ["2021", "2023"],
      "marks": "5",
      "tips": "how to answer it well"
    }}
  ]
}}"#
    )
}

pub fn expand_topic_prompt(topic: &str, context: Option<&str>) -> String {
    let context_line = context
        .filter(|c| !c.trim().is_empty())
        .map(|c| format!("The branch belongs to a mindmap about \"{c}\".\n"))
        .unwrap_or_default();
    format!(
        r#"You are extending one branch of a study mindmap.
{context_line}Break the concept "{topic}" into 3 to 6 sub-concepts, each a keyword of 1 to 3 words.

Respond with exactly one JSON object:
{{
  "nodes": [
    {{"id": "unique-id", "label": "Sub-concept"}}
  ]
}}"#
    )
}

pub fn visualize_text_prompt(text: &str) -> String {
    format!(
        r#"Explain the text below as a short sequence of steps a student can follow.
Where a diagram helps, make that step a fenced mermaid block (```mermaid ... ```), flowchart or sequence diagram only.

Respond with exactly one JSON object:
{{
  "steps": ["step one", "```mermaid\nflowchart TD\n  A --> B\n```"]
}}

Text:
{text}"#
    )
}

const MINDMAP_TEMPLATE: &str = r#"You are a mindmap generator in the style of NotebookLM.
Turn the content below into a structured, hierarchical mindmap. The output MUST be one valid JSON object.

### STEPS
1. Find the core topic. It becomes the root node.
2. Extract the main branches: the primary themes or sections.
3. Extract sub-branches for each main branch: key points, concepts or data. Go one level deeper when the content supports it.
4. Label every node with a short keyword of 1 to 3 words.
5. Give each main branch a colour theme (blue, green, purple, orange...) that its children inherit.

### SHAPE
- A `title` (the core topic) and a flat list of `nodes`.
- Each node has `id` (unique, e.g. "node-1", "node-2.1"), `label`, optional `parentId` (absent only on the root) and optional `theme`.

### EXAMPLE
Input: "Photosynthesis is how green plants use sunlight, water and carbon dioxide to make food. It has light-dependent reactions and the Calvin cycle, which produces glucose."
Output:
{
  "title": "Photosynthesis",
  "nodes": [
    {"id": "root", "label": "Photosynthesis"},
    {"id": "node-1", "label": "Inputs", "parentId": "root", "theme": "blue"},
    {"id": "node-1.1", "label": "Sunlight", "parentId": "node-1"},
    {"id": "node-1.2", "label": "Water", "parentId": "node-1"},
    {"id": "node-1.3", "label": "Carbon Dioxide", "parentId": "node-1"},
    {"id": "node-2", "label": "Stages", "parentId": "root", "theme": "green"},
    {"id": "node-2.1", "label": "Light Reactions", "parentId": "node-2"},
    {"id": "node-2.2", "label": "Calvin Cycle", "parentId": "node-2"},
    {"id": "node-3", "label": "Outputs", "parentId": "root", "theme": "orange"},
    {"id": "node-3.1", "label": "Glucose", "parentId": "node-3"}
  ]
}

Build the mindmap from this content:
{{USER_CONTENT}}"#;

const INFOGRAPHIC_TEMPLATE: &str = r#"You are an infographic generator.
Turn the content below into a structured infographic. The output MUST be one valid JSON object.

### STEPS
1. Find the core topic. It becomes the title.
2. Pick 2 or 3 key takeaways as `highlight_insights`.
3. Split the content into logical sections, each with a heading.
4. Fill each section with short bullet items.
5. Suggest a visual hint for each section.

### SHAPE
- `title`, `highlight_insights` (list of strings) and `sections`.
- Each section has `heading`, `content_type` ("list", "steps" or "comparison"), `visual_hint` ("chart", "timeline", "arrow-flow" or "list") and `items` (list of strings).

### EXAMPLE
Input: "The water cycle is the continuous movement of water on, above and below the Earth's surface. Its stages are evaporation, condensation, precipitation and collection."
Output:
{
  "title": "The Water Cycle",
  "highlight_insights": ["Continuous Movement", "Four Main Stages"],
  "sections": [
    {
      "heading": "Stages of the Water Cycle",
      "content_type": "steps",
      "visual_hint": "arrow-flow",
      "items": [
        "Evaporation: water turns into vapour and rises.",
        "Condensation: vapour cools into clouds.",
        "Precipitation: water falls as rain, snow, sleet or hail.",
        "Collection: water gathers in rivers, lakes, oceans and underground."
      ]
    }
  ]
}

Build the infographic from this content:
{{USER_CONTENT}}"#;

pub fn mindmap_prompt(content: &str) -> String {
    MINDMAP_TEMPLATE.replace(USER_CONTENT, content)
}

pub fn infographic_prompt(content: &str) -> String {
    INFOGRAPHIC_TEMPLATE.replace(USER_CONTENT, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_interpolate_user_content() {
        let prompt = mindmap_prompt("Newton's laws");
        assert!(prompt.ends_with("Newton's laws"));
        assert!(!prompt.contains(USER_CONTENT));
        assert!(infographic_prompt("Tides").ends_with("Tides"));
    }

    #[test]
    fn socratic_instruction_names_language_and_schema() {
        let s = socratic_system_instruction("Hindi");
        assert!(s.contains("Reply to the student in Hindi"));
        assert!(s.contains("\"detected_sentiment\""));
    }

    #[test]
    fn quiz_prompt_carries_module_id() {
        let p = quiz_prompt("Fractions", "Easy", "mod-7");
        assert!(p.contains("\"moduleId\": \"mod-7\""));
        assert!(p.contains("\"Easy\" difficulty"));
    }

    #[test]
    fn expand_prompt_mentions_context_only_when_given() {
        assert!(expand_topic_prompt("Mitosis", Some("Cell Biology")).contains("Cell Biology"));
        assert!(!expand_topic_prompt("Mitosis", Some("  ")).contains("belongs to"));
        assert!(!expand_topic_prompt("Mitosis", None).contains("belongs to"));
    }
}
