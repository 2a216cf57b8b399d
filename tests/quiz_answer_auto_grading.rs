
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, student, teacher, temp_dir};

struct QuizIds {
    quiz_id: String,
    mc_question: String,
    text_question: String,
}

fn quiz_with_two_questions(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> QuizIds {
    let quiz = request_ok(
        stdin,
        reader,
        "quiz",
        "quiz.create",
        json!({ "roomId": "room-1", "title": "Capitals", "actor": teacher() }),
    );
    let quiz_id = quiz
        .pointer("/quiz/quizId")
        .and_then(|v| v.as_str())
        .expect("quizId")
        .to_string();
    let mc = request_ok(
        stdin,
        reader,
        "q1",
        "quiz.addQuestion",
        json!({
            "quizId": quiz_id,
            "text": "Capital of France?",
            "type": "multiple_choice",
            "choices": ["Paris", "Lyon", "Nice"],
            "correctAnswer": "Paris",
            "timeLimit": 30,
            "actor": teacher()
        }),
    );
    let text = request_ok(
        stdin,
        reader,
        "q2",
        "quiz.addQuestion",
        json!({ "quizId": quiz_id, "text": "Why?", "type": "text", "timeLimit": 30, "actor": teacher() }),
    );
    QuizIds {
        quiz_id,
        mc_question: mc
            .pointer("/question/questionId")
            .and_then(|v| v.as_str())
            .expect("questionId")
            .to_string(),
        text_question: text
            .pointer("/question/questionId")
            .and_then(|v| v.as_str())
            .expect("questionId")
            .to_string(),
    }
}

#[test]
fn multiple_choice_grades_at_submission_without_grade_calls() {
    let workspace = temp_dir("classroomd-auto-grading");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = quiz_with_two_questions(&mut stdin, &mut reader);

    let right = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Paris", "actor": student("s1", "Arnold") }),
    );
    assert_eq!(
        right.pointer("/answer/isCorrect").and_then(|v| v.as_bool()),
        Some(true)
    );

    let wrong = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Lyon", "actor": student("s2", "Phoebe") }),
    );
    assert_eq!(
        wrong.pointer("/answer/isCorrect").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Free text stays ungraded until a teacher decides.
    let text = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "quiz.submitAnswer",
        json!({ "questionId": ids.text_question, "answerText": "it just is", "actor": student("s1", "Arnold") }),
    );
    assert!(text.pointer("/answer/isCorrect").expect("isCorrect").is_null());
    let answer_id = text
        .pointer("/answer/answerId")
        .and_then(|v| v.as_str())
        .expect("answerId")
        .to_string();

    // Manual grading is teacher-only and stamps provenance.
    request_err(
        &mut stdin,
        &mut reader,
        "5",
        "quiz.gradeAnswer",
        json!({ "answerId": answer_id, "isCorrect": true, "actor": student("s1", "Arnold") }),
        "forbidden",
    );
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "quiz.gradeAnswer",
        json!({ "answerId": answer_id, "isCorrect": true, "actor": teacher() }),
    );
    assert_eq!(
        graded.pointer("/answer/isCorrect").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        graded.pointer("/answer/scoredBy").and_then(|v| v.as_str()),
        Some("t1")
    );
    assert!(graded.pointer("/answer/scoredAt").and_then(|v| v.as_i64()).is_some());
}

#[test]
fn one_answer_per_user_and_question() {
    let workspace = temp_dir("classroomd-duplicate-answer");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = quiz_with_two_questions(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Paris", "actor": student("s1", "Arnold") }),
    );
    request_err(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Lyon", "actor": student("s1", "Arnold") }),
        "duplicate_answer",
    );

    // A different user on the same question is fine.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Paris", "actor": student("s2", "Phoebe") }),
    );
}

#[test]
fn students_never_see_the_answer_key_or_others_answers() {
    let workspace = temp_dir("classroomd-quiz-visibility");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = quiz_with_two_questions(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Paris", "actor": student("s1", "Arnold") }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quiz.submitAnswer",
        json!({ "questionId": ids.mc_question, "answerText": "Lyon", "actor": student("s2", "Phoebe") }),
    );

    let student_view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "quiz.open",
        json!({ "quizId": ids.quiz_id, "includeAnswers": true, "actor": student("s1", "Arnold") }),
    );
    assert!(student_view
        .pointer("/questions/0/correctAnswer")
        .expect("correctAnswer")
        .is_null());
    let answers = student_view
        .get("answers")
        .and_then(|v| v.as_array())
        .expect("answers");
    assert_eq!(answers.len(), 1);
    assert_eq!(
        answers[0].get("userId").and_then(|v| v.as_str()),
        Some("s1")
    );

    let teacher_view = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "quiz.open",
        json!({ "quizId": ids.quiz_id, "includeAnswers": true, "actor": teacher() }),
    );
    assert_eq!(
        teacher_view.pointer("/questions/0/correctAnswer"),
        Some(&json!("Paris"))
    );
    assert_eq!(
        teacher_view.get("answers").and_then(|v| v.as_array()).expect("answers").len(),
        2
    );
}
