//! Built-in prompt templates.
//!
//! Placeholders are `{{name}}`. The tag names and fence markers used here are
//! the ones the extractor looks for; `stages::verify_stage_table` checks that
//! they stay in sync.

pub const SCHEMA_LINKING: &str = r#"<instructions>
Find the schema_links for generating SQL queries for each question based on the database schema and Foreign keys.
Think step by step, then write the final schema_links inside <links></links> tags.
Only use tables and columns that appear in the schema.
</instructions>
<example>
Table city, columns = [*,City_ID,Official_Name,Status,Area_km_2,Population,Census_Ranking]
Table competition_record, columns = [*,Competition_ID,Farm_ID,Rank]
Table farm, columns = [*,Farm_ID,Year,Total_Horses,Working_Horses,Total_Cattle,Oxen,Bulls,Cows,Pigs,Sheep_and_Goats]
Table farm_competition, columns = [*,Competition_ID,Year,Theme,Host_city_ID,Hosts]
Foreign_keys = [farm_competition.Host_city_ID = city.City_ID,competition_record.Farm_ID = farm.Farm_ID,competition_record.Competition_ID = farm_competition.Competition_ID]
Q: "Show the status of the city that has hosted the greatest number of competitions."
A: Let's think step by step. In the question "Show the status of the city that has hosted the greatest number of competitions.", we are asked:
"the status of the city" so we need column = [city.Status]
"greatest number of competitions" so we need column = [farm_competition.*]
Based on the columns and tables, we need these Foreign_keys = [farm_competition.Host_city_ID = city.City_ID].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = []. So the Schema_links are:
<links>[city.Status,farm_competition.Host_city_ID = city.City_ID,farm_competition.*]</links>
</example>
<example>
Table customers, columns = [*,customer_id,name,email,signup_date]
Table orders, columns = [*,order_id,customer_id,total,ordered_at]
Foreign_keys = [orders.customer_id = customers.customer_id]
Q: "How many customers do we have?"
A: Let's think step by step. In the question "How many customers do we have?", we are asked:
"How many customers" so we need column = [customers.customer_id]
Based on the columns and tables, we need these Foreign_keys = [].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = []. So the Schema_links are:
<links>[customers.customer_id]</links>
</example>
<example>
Table department, columns = [*,Department_ID,Name,Creation,Ranking,Budget_in_Billions,Num_Employees]
Table head, columns = [*,head_ID,name,born_state,age]
Table management, columns = [*,department_ID,head_ID,temporary_acting]
Foreign_keys = [management.head_ID = head.head_ID,management.department_ID = department.Department_ID]
Q: "What are the distinct creation years of the departments managed by a secretary born in state 'Alabama'?"
A: Let's think step by step. In the question "What are the distinct creation years of the departments managed by a secretary born in state 'Alabama'?", we are asked:
"distinct creation years of the departments" so we need column = [department.Creation]
"departments managed by" so we need column = [management.department_ID]
"born in" so we need column = [head.born_state]
Based on the columns and tables, we need these Foreign_keys = [department.Department_ID = management.department_ID,management.head_ID = head.head_ID].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = ['Alabama']. So the Schema_links are:
<links>[department.Creation,department.Department_ID = management.department_ID,head.head_ID = management.head_ID,head.born_state,'Alabama']</links>
</example>
<question>
{{fields}}Foreign_keys = {{foreign_keys}}
Q: "{{question}}"
</question>"#;

pub const CLASSIFICATION: &str = r#"<instructions>
For the given question, classify it as EASY, NON-NESTED, or NESTED based on nested queries and JOIN.
if need nested queries: predict NESTED
elif need JOIN and don't need nested queries: predict NON-NESTED
elif don't need JOIN and don't need nested queries: predict EASY
Write exactly one label inside <label></label> tags.
For NESTED questions, also write the sub-questions inside <sub_questions></sub_questions> tags as questions = ["..."].
</instructions>
<example>
Table concert, columns = [*,concert_ID,concert_Name,Theme,Stadium_ID,Year]
Table stadium, columns = [*,Stadium_ID,Location,Name,Capacity,Highest,Lowest,Average]
Foreign_keys = [concert.Stadium_ID = stadium.Stadium_ID]
Q: "What are the names and locations of the stadiums that had no concerts in 2014?"
schema_links: [stadium.Name,stadium.Location,concert.Stadium_ID = stadium.Stadium_ID,concert.Year,2014]
A: Let's think step by step. The SQL query for the question "What are the names and locations of the stadiums that had no concerts in 2014?" needs these tables = [stadium,concert], so we need JOIN.
Plus, it requires nested queries with (INTERSECT, UNION, or EXCEPT, IN, or NOT IN), and we need the answer to the questions = ["Which stadiums hosted concerts in 2014?"].
So, we need JOIN and need nested queries, then the SQL query can be classified as <label>NESTED</label>
<sub_questions>questions = ["Which stadiums hosted concerts in 2014?"]</sub_questions>
</example>
<example>
Table customers, columns = [*,customer_id,name,email,signup_date]
Table orders, columns = [*,order_id,customer_id,total,ordered_at]
Foreign_keys = [orders.customer_id = customers.customer_id]
Q: "How many customers do we have?"
schema_links: [customers.customer_id]
A: Let's think step by step. The SQL query for the question "How many customers do we have?" needs these tables = [customers], so we don't need JOIN.
Plus, it doesn't require nested queries with (INTERSECT, UNION, or EXCEPT, IN, or NOT IN), and we need the answer to the questions = [""].
So, we don't need JOIN and don't need nested queries, then the SQL query can be classified as <label>EASY</label>
</example>
<example>
Table course, columns = [*,course_id,title,dept_name,credits]
Table teaches, columns = [*,ID,course_id,sec_id,semester,year]
Foreign_keys = [teaches.course_id = course.course_id]
Q: "Find the title of the courses taught in Fall 2009."
schema_links: [course.title,course.course_id = teaches.course_id,teaches.semester,teaches.year,'Fall',2009]
A: Let's think step by step. The SQL query for the question "Find the title of the courses taught in Fall 2009." needs these tables = [course,teaches], so we need JOIN.
Plus, it doesn't require nested queries with (INTERSECT, UNION, or EXCEPT, IN, or NOT IN), and we need the answer to the questions = [""].
So, we need JOIN and don't need nested queries, then the SQL query can be classified as <label>NON-NESTED</label>
</example>
<question>
{{fields}}Foreign_keys = {{foreign_keys}}
Q: "{{question}}"
schema_links: {{schema_links}}
</question>"#;

pub const EASY_GENERATION: &str = r#"<instructions>
Use the schema links to generate the SQL query for the question.
Write a single SQL statement between ```sql and ``` fences.
Only read data. If the question asks to add, change or remove data, write a short refusal inside <refusal></refusal> tags instead of a query.
</instructions>
<example>
Table customers, columns = [*,customer_id,name,email,signup_date]
Q: "How many customers do we have?"
Schema_links: [customers.customer_id]
SQL: ```sql
SELECT COUNT(*) FROM customers
```
</example>
<example>
Table classroom, columns = [*,building,room_number,capacity]
Q: "Find the buildings which have rooms with capacity more than 50."
Schema_links: [classroom.building,classroom.capacity,50]
SQL: ```sql
SELECT DISTINCT building FROM classroom WHERE capacity > 50
```
</example>
<example>
Table customers, columns = [*,customer_id,name,email,signup_date]
Q: "delete all the customers"
Schema_links: [customers.*]
SQL: ```sql
<refusal>I can only answer questions that read data. Deleting customers would modify the database, so no query was written.</refusal>
```
</example>
<question>
{{fields}}
Q: "{{question}}"
Schema_links: {{schema_links}}
</question>"#;

pub const MEDIUM_GENERATION: &str = r#"<instructions>
Use the schema links and Intermediate_representation to generate the SQL query for the question.
Write the final SQL statement between ```sql and ``` fences; when you write more than one, the last one is used.
Only read data. If the question asks to add, change or remove data, write a short refusal inside <refusal></refusal> tags instead of a query.
</instructions>
<example>
Table department, columns = [*,dept_name,building,budget]
Table instructor, columns = [*,ID,name,dept_name,salary]
Foreign_keys = [instructor.dept_name = department.dept_name]
Q: "Find the total budgets of the Marketing or Finance department."
Schema_links: [department.budget,department.dept_name,'Marketing','Finance']
A: Let's think step by step. For creating the SQL for the given question, we need to join these tables = [].
First, create an intermediate representation, then use it to construct the SQL query.
Intermediate_representation: select sum(department.budget) from department where department.dept_name = "Marketing" or department.dept_name = "Finance"
SQL: ```sql
SELECT sum(budget) FROM department WHERE dept_name = 'Marketing' OR dept_name = 'Finance'
```
</example>
<example>
Table course, columns = [*,course_id,title,dept_name,credits]
Table teaches, columns = [*,ID,course_id,sec_id,semester,year]
Foreign_keys = [teaches.course_id = course.course_id]
Q: "Find the title of the courses taught in Fall 2009."
Schema_links: [course.title,course.course_id = teaches.course_id,teaches.semester,teaches.year,'Fall',2009]
A: Let's think step by step. For creating the SQL for the given question, we need to join these tables = [course,teaches].
First, create an intermediate representation, then use it to construct the SQL query.
Intermediate_representation: select course.title from course join teaches on course.course_id = teaches.course_id where teaches.semester = "Fall" and teaches.year = 2009
SQL: ```sql
SELECT T1.title FROM course AS T1 JOIN teaches AS T2 ON T1.course_id = T2.course_id WHERE T2.semester = 'Fall' AND T2.year = 2009
```
</example>
<question>
{{fields}}Foreign_keys = {{foreign_keys}}
Q: "{{question}}"
Schema_links: {{schema_links}}
</question>"#;

pub const HARD_GENERATION: &str = r#"<instructions>
Use the intermediate representation, the schema links and the SQL already written for each sub-question to generate the SQL query for the question.
Write the final SQL statement between ```sql and ``` fences; when you write more than one, the last one is used.
Only read data. If the question asks to add, change or remove data, write a short refusal inside <refusal></refusal> tags instead of a query.
</instructions>
<example>
Table course, columns = [*,course_id,title,dept_name,credits]
Table prereq, columns = [*,course_id,prereq_id]
Foreign_keys = [prereq.course_id = course.course_id]
Q: "Find the title of courses that have two prerequisites?"
Schema_links: [course.title,course.course_id = prereq.course_id]
Sub-questions:
- "What are the course ids of courses with two prerequisites?" SQL: SELECT course_id FROM prereq GROUP BY course_id HAVING count(*) = 2
A: Let's think step by step. "Find the title of courses that have two prerequisites?" can be solved by knowing the answer to the following sub-question "What are the course ids of courses with two prerequisites?".
The SQL query for the sub-question "What are the course ids of courses with two prerequisites?" is SELECT course_id FROM prereq GROUP BY course_id HAVING count(*) = 2
So, the answer to the question "Find the title of courses that have two prerequisites?" is =
Intermediate_representation: select course.title from course where @.@ in ( select prereq.course_id from prereq group by prereq.course_id having count ( * ) = 2 )
SQL: ```sql
SELECT title FROM course WHERE course_id IN (SELECT T1.course_id FROM prereq AS T1 GROUP BY T1.course_id HAVING count(*) = 2)
```
</example>
<question>
{{fields}}Foreign_keys = {{foreign_keys}}
Q: "{{question}}"
Schema_links: {{schema_links}}
Sub-questions:
{{solved_sub_queries}}
</question>"#;

pub const CORRECTION: &str = r#"<instructions>
For the given question, use the provided tables, columns, foreign keys, and primary keys to fix the given {{dialect}} SQL QUERY for any issues. If there are any problems, fix them. If there are no issues, return the SQL QUERY as is.
Use the following instructions for fixing the SQL QUERY:
1) Use the database values that are explicitly mentioned in the question.
2) Pay attention to the columns that are used for the JOIN by using the Foreign_keys.
3) Use DESC and DISTINCT when needed.
4) Pay attention to the columns that are used for the GROUP BY statement.
5) Pay attention to the columns that are used for the SELECT statement.
6) Only change the GROUP BY clause when necessary (Avoid redundant columns in GROUP BY).
7) Use GROUP BY on one column only.
8) Use the database error to locate the problem, and only use syntax that {{dialect}} supports.
Write only the fixed query between ```sql and ``` fences.
</instructions>
<question>
{{fields}}Foreign_keys = {{foreign_keys}}
Primary_keys = {{primary_keys}}
Question: "{{question}}"
SQL QUERY: {{sql}}
Database error: {{error}}
</question>"#;
